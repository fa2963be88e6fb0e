//! QLAFS trust node.
//!
//! One process hosting the whole trust-establishment pipeline:
//!
//! ```text
//! submit(subject, evidence)
//!     │  FingerprintGenerator
//!     ▼
//! ConsensusEngine ◀── SharedRegistry ──▶ TrustCalculator
//!     │  VerdictSink                          ▲
//!     ▼                                       │
//! TransparencyLog ──────────────────────────────┘
//!     │  AnchoringJob
//!     ▼
//! AnchorClient
//! ```

pub mod error;
pub mod node;

pub use error::{NodeError, Result};
pub use node::TrustNode;
