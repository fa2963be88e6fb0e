//! Trust score calculator for QLAFS subjects.
//!
//! A subject's score is a weighted sum of four positive terms minus a
//! security-incident penalty, clamped to `[0, 1]`:
//!
//! ```text
//! score = w1·verification_history + w2·consensus_participation
//!       + w3·behavioral_consistency + w4·performance_metrics
//!       − w5·security_incidents
//! ```
//!
//! Scores are never stored; they are recomputed on demand from the
//! transparency log and the validator registry.

pub mod error;
pub mod inputs;
pub mod score;

pub use error::{Result, TrustError};
pub use inputs::TrustInputs;
pub use score::{validate_weights, TrustCalculator, TrustScore};
