//! Persisted model of one distribution epoch.
//!
//! An [`EpochCheckpoint`] is the live, resumable state of a stamp. It is
//! replaced by an [`EpochResult`] once the epoch terminates.
//!
//! ## Invariants
//! - `processed` and `pending` are disjoint.
//! - `processed` only grows; a processed score is never resubmitted.
//! - Scores are identified by fingerprint inside an epoch.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

use crate::types::{DistributionSummary, Score, ScoreRecord, Stamp};

/// Phase the coordinator resumes from after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EpochPhase {
    /// A generation of batch submissions is (or is about to be) in flight.
    Submitting,
    /// All generations are done; `distribute` has not succeeded yet.
    Finalizing,
    /// The ledger finalized the epoch; the summary is being persisted off-ledger.
    Persisting {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<DistributionSummary>,
        retries_left: u32,
    },
}

impl EpochPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpochPhase::Submitting => "submitting",
            EpochPhase::Finalizing => "finalizing",
            EpochPhase::Persisting { .. } => "persisting",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochCheckpoint {
    pub stamp: Stamp,
    pub generation: u32,
    /// Number of scores submitted by the current generation.
    pub total: u64,
    /// Number of distinct scores in the epoch.
    pub epoch_total: u64,
    /// Budget shared by recovery generations and finalize retries.
    pub retries_remaining: u32,
    /// Deduplicated epoch input, in input order.
    pub scores: Vec<Score>,
    /// Fingerprints accepted by the ledger.
    pub processed: BTreeSet<String>,
    /// Fingerprints awaiting (re)submission, in input order.
    pub pending: Vec<String>,
    pub phase: EpochPhase,
    pub updated_at_ms: u64,
}

impl EpochCheckpoint {
    /// Creates generation 0 for `scores`.
    ///
    /// Returns the checkpoint and the fingerprints dropped as duplicates (the
    /// first occurrence wins).
    pub fn start(stamp: Stamp, scores: Vec<Score>, retries: u32, now_ms: u64) -> (Self, Vec<String>) {
        let mut seen = HashSet::new();
        let mut kept = Vec::with_capacity(scores.len());
        let mut duplicates = Vec::new();
        for score in scores {
            if seen.insert(score.fingerprint.clone()) {
                kept.push(score);
            } else {
                duplicates.push(score.fingerprint);
            }
        }
        let pending: Vec<String> = kept.iter().map(|s| s.fingerprint.clone()).collect();
        let n = pending.len() as u64;
        (
            Self {
                stamp,
                generation: 0,
                total: n,
                epoch_total: n,
                retries_remaining: retries,
                scores: kept,
                processed: BTreeSet::new(),
                pending,
                phase: EpochPhase::Submitting,
                updated_at_ms: now_ms,
            },
            duplicates,
        )
    }

    /// Scores of the current generation, in input order.
    pub fn pending_scores(&self) -> Vec<Score> {
        let pending: HashSet<&str> = self.pending.iter().map(String::as_str).collect();
        self.scores
            .iter()
            .filter(|s| pending.contains(s.fingerprint.as_str()))
            .cloned()
            .collect()
    }

    /// Moves accepted fingerprints from `pending` to `processed`.
    pub fn absorb<'a>(&mut self, accepted: impl IntoIterator<Item = &'a str>) {
        for fp in accepted {
            if let Some(pos) = self.pending.iter().position(|p| p == fp) {
                let fp = self.pending.remove(pos);
                self.processed.insert(fp);
            }
        }
    }

    /// Closes the current generation.
    ///
    /// With failures left and budget remaining, opens the next generation over
    /// the failed scores and returns `true`. Otherwise moves to `Finalizing`
    /// (remaining failures stay in `pending` as unprocessed).
    pub fn recover(&mut self, now_ms: u64) -> bool {
        self.updated_at_ms = now_ms;
        if !self.pending.is_empty() && self.retries_remaining > 0 {
            self.generation = self.generation.saturating_add(1);
            self.retries_remaining -= 1;
            self.total = self.pending.len() as u64;
            self.phase = EpochPhase::Submitting;
            true
        } else {
            self.phase = EpochPhase::Finalizing;
            false
        }
    }

    /// Consumes one finalize retry; `false` when the budget is spent.
    pub fn retry_finalize(&mut self, now_ms: u64) -> bool {
        self.updated_at_ms = now_ms;
        if self.retries_remaining == 0 {
            return false;
        }
        self.retries_remaining -= 1;
        true
    }

    pub fn enter_persist(&mut self, persist_retries: u32, now_ms: u64) {
        self.updated_at_ms = now_ms;
        self.phase = EpochPhase::Persisting {
            summary: None,
            retries_left: persist_retries,
        };
    }

    pub fn processed_records(&self) -> Vec<ScoreRecord> {
        self.scores
            .iter()
            .filter(|s| self.processed.contains(&s.fingerprint))
            .map(Score::to_record)
            .collect()
    }

    pub fn unprocessed_records(&self) -> Vec<ScoreRecord> {
        self.pending_scores().iter().map(Score::to_record).collect()
    }
}

/// Why an epoch ended in a non-clean terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EpochFailure {
    /// The ledger is not configured; nothing was attempted.
    Configuration { reason: String },
    /// `distribute` never succeeded within the shared retry budget.
    FinalizeExhausted,
    /// The summary could not be fetched or uploaded within the persist budget.
    PersistExhausted,
}

impl EpochFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpochFailure::Configuration { .. } => "configuration",
            EpochFailure::FinalizeExhausted => "finalize_exhausted",
            EpochFailure::PersistExhausted => "persist_exhausted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochResult {
    pub stamp: Stamp,
    pub complete: bool,
    pub scores: Vec<ScoreRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<DistributionSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_ref: Option<String>,
    #[serde(default)]
    pub unprocessed: Vec<ScoreRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<EpochFailure>,
    pub finished_at_ms: u64,
}

impl EpochResult {
    pub fn from_checkpoint(
        cp: &EpochCheckpoint,
        complete: bool,
        summary: Option<DistributionSummary>,
        summary_ref: Option<String>,
        failure: Option<EpochFailure>,
        now_ms: u64,
    ) -> Self {
        Self {
            stamp: cp.stamp,
            complete,
            scores: cp.processed_records(),
            summary,
            summary_ref,
            unprocessed: cp.unprocessed_records(),
            failure,
            finished_at_ms: now_ms,
        }
    }

    pub fn outcome(&self) -> &'static str {
        match (&self.failure, self.complete) {
            (Some(f), _) => f.as_str(),
            (None, true) => "complete",
            (None, false) => "incomplete",
        }
    }
}
