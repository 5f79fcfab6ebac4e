#![forbid(unsafe_code)]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::float_cmp)]
#![deny(clippy::cast_precision_loss)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::cast_sign_loss)]

//! Relay reward workflows.
//!
//! - [`DistributionCoordinator`]: per-stamp epoch state machine that submits
//!   scores in batches, finalizes the distribution on the ledger and persists
//!   the summary off-ledger.
//! - [`ClaimGate`]: decides which relays become claimable (including the
//!   hardware attestation pipeline) and reconciles declared families.
//!
//! Both run their ledger writes behind a [`Pacer`] and read ledger state
//! through the [`ConsistencyCache`].

pub mod broker;
pub mod cache;
pub mod claim_gate;
pub mod coordinator;
pub mod hardware;
pub mod metrics;
pub mod pacing;

pub use broker::{BrokerError, JobBroker, JobHandler, JobNode, JobOutput, JobPayload};
pub use cache::{CacheError, ConsistencyCache, ReadSource, DISTRIBUTION_MAX_AGE, REGISTRY_MAX_AGE};
pub use claim_gate::{BatchFailurePolicy, ClaimGate, ClaimGateConfig, ClaimOutcome};
pub use coordinator::{CoordinatorConfig, CoordinatorError, DistributionCoordinator};
pub use hardware::{HardwareOutcome, HardwareVerifier};
pub use pacing::{FixedDelayPacer, Pacer, PacingConfig, TokenBucketPacer};
