//! Byzantine-fault-tolerant agreement on agent fingerprints.
//!
//! Validators registered in the [`ValidatorRegistry`] run a bounded-round
//! pBFT protocol (pre-prepare, prepare, commit) over an explicit
//! [`MessageBus`]. With `n >= 3f + 1` validators, `2f + 1` matching signed
//! commit votes form a [`QuorumCertificate`] and finalize the proposal.
//!
//! ```text
//! submit -> driver: snapshot active set -> Propose(leader)
//!                     leader -> PrePrepare -> all
//!                     all -> Prepare votes -> all
//!                     2f+1 prepares -> Commit votes -> all
//!                     2f+1 commits -> Finalized -> VerdictSink
//!           timeout: suspect leader, round + 1, until max_view_changes
//! ```

pub mod engine;
pub mod error;
pub mod message;
pub mod network;
pub mod proposal;
pub mod quorum;
pub mod registry;
pub mod validator;

pub use engine::{
    ConsensusEngine, ConsensusEvent, FinalizedVerdict, ProposalResult, SinkError, VerdictSink,
};
pub use error::{ConsensusError, Result};
pub use message::{leader_for, ConsensusMessage, Decision, Phase, ProposalRequest, Vote};
pub use network::{Endpoint, Envelope, MessageBus, ENGINE_ENDPOINT};
pub use proposal::{AbortInfo, FinalizedOutcome, ProposalStatus, ProposalSummary};
pub use quorum::{QuorumCertificate, VoteTally};
pub use registry::{
    ActiveMember, FaultEvidence, RegistryStats, SharedRegistry, Validator, ValidatorRegistry,
    ValidatorStatus,
};
pub use validator::{ValidatorBehavior, ValidatorNode};
