//! Integration tests for the QLAFS trust pipeline
//!
//! This test suite validates:
//! - Fingerprint submission through consensus into the transparency log
//! - Byzantine validator detection (equivocation, silent leaders)
//! - Inclusion and consistency proofs against signed tree heads
//! - Durable logs surviving a node restart, and external anchoring
//! - Trust scores derived from recorded verdicts

pub mod test_utils;

#[cfg(test)]
mod scenario_tests;

#[cfg(test)]
mod property_tests;
