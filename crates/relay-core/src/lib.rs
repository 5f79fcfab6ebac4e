#![forbid(unsafe_code)]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::float_cmp)]
#![deny(clippy::cast_precision_loss)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::cast_sign_loss)]

//! Core types and primitives for relay reward distribution.
//!
//! This crate defines the shared vocabulary of the workflow crates: scores and
//! their batches, relay claims and hardware proofs, the persisted epoch model,
//! and the transport-agnostic contract towards the external ledger and its
//! collaborators (read replica, sale registry, durable store).

pub mod attestation;
pub mod batch;
pub mod epoch;
pub mod ledger_contract;
pub mod types;

pub use attestation::{AttestationProof, AttestationRejection};
pub use batch::{plan, FAMILY_BATCH_SIZE, MAX_BATCH_SIZE};
pub use epoch::{EpochCheckpoint, EpochFailure, EpochPhase, EpochResult};
pub use types::{
    is_valid_address, is_valid_fingerprint, normalize_address, ClaimDecision, ClaimResult,
    ClaimableRelay, ContractState, DistributionSummary, FamilyUpdate, HardwareProof, Score,
    ScoreRecord, Stamp, ValidatedRelay,
};

/// Current wall-clock time in milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    u64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(u64::MAX)
}
