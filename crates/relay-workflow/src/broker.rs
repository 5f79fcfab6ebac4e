//! In-process, tree-shaped job executor.
//!
//! A [`JobNode`] runs only after every child has produced a terminal
//! [`JobOutput`]; its handler receives the children's outputs in child order.
//! Children run concurrently and report `(index, output)` over a channel into
//! the parent's result slots.
//!
//! Execution is at-least-once: a handler that panics is re-executed up to
//! `max_attempts` times. Handlers never fail by returning an error; failures
//! are encoded in their output.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{DistributionSummary, Score, Stamp};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::metrics::JOB_EXECUTIONS_TOTAL;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Typed job input, one variant per job kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// Submit one score batch for a stamp.
    AddScores {
        stamp: Stamp,
        generation: u32,
        batch_index: usize,
        scores: Vec<Score>,
    },
    /// Aggregate the batch results of one generation.
    CollectScores { stamp: Stamp, generation: u32 },
    /// Finalize a stamp on the ledger.
    Distribute { stamp: Stamp },
    /// Read the ledger's summary for a stamp.
    FetchSummary { stamp: Stamp },
    /// Upload a summary to durable storage.
    PersistSummary { summary: DistributionSummary },
}

impl JobPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::AddScores { .. } => "add_scores",
            JobPayload::CollectScores { .. } => "collect_scores",
            JobPayload::Distribute { .. } => "distribute",
            JobPayload::FetchSummary { .. } => "fetch_summary",
            JobPayload::PersistSummary { .. } => "persist_summary",
        }
    }
}

/// Why a ledger-facing job did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum JobFailure {
    /// Missing credentials or contract; retrying cannot help.
    Configuration { reason: String },
    /// Network, protocol or availability failure; retryable within budget.
    Transient { reason: String },
}

impl JobFailure {
    pub fn reason(&self) -> &str {
        match self {
            JobFailure::Configuration { reason } | JobFailure::Transient { reason } => reason,
        }
    }
}

/// Typed job result, one variant per job kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOutput {
    AddScores {
        batch_index: usize,
        fingerprints: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<JobFailure>,
    },
    CollectScores {
        accepted: Vec<String>,
        failed: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        configuration: Option<String>,
    },
    Distribute {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<JobFailure>,
    },
    FetchSummary {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<DistributionSummary>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<JobFailure>,
    },
    PersistSummary {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<JobFailure>,
    },
    /// The handler refused its children's outputs.
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobNode {
    pub name: String,
    pub queue: String,
    pub payload: JobPayload,
    #[serde(default)]
    pub children: Vec<JobNode>,
}

impl JobNode {
    pub fn leaf(name: impl Into<String>, queue: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            payload,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<JobNode>) -> Self {
        self.children = children;
        self
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Executes one node. `children` holds the children's outputs in child order.
    async fn handle(&self, payload: JobPayload, children: Vec<JobOutput>) -> JobOutput;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("job {name} failed after {attempts} attempts: {reason}")]
    JobFailed {
        name: String,
        attempts: u32,
        reason: String,
    },
    #[error("job {name} is missing results from {missing} children")]
    Incomplete { name: String, missing: usize },
}

pub type JobFuture = Pin<Box<dyn Future<Output = Result<JobOutput, BrokerError>> + Send>>;

#[derive(Clone)]
pub struct JobBroker {
    handler: Arc<dyn JobHandler>,
    max_attempts: u32,
}

impl std::fmt::Debug for JobBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobBroker")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl JobBroker {
    pub fn new(handler: Arc<dyn JobHandler>, max_attempts: u32) -> Self {
        Self {
            handler,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Runs `node` and its subtree to completion.
    pub fn run(&self, node: JobNode) -> JobFuture {
        let broker = self.clone();
        Box::pin(async move {
            let JobNode {
                name,
                queue,
                payload,
                children,
            } = node;

            let n = children.len();
            let (tx, mut rx) = mpsc::channel::<(usize, Result<JobOutput, BrokerError>)>(n.max(1));
            for (index, child) in children.into_iter().enumerate() {
                let tx = tx.clone();
                let fut = broker.run(child);
                tokio::spawn(async move {
                    let out = fut.await;
                    let _ = tx.send((index, out)).await;
                });
            }
            drop(tx);

            let mut slots: Vec<Option<JobOutput>> = (0..n).map(|_| None).collect();
            while let Some((index, out)) = rx.recv().await {
                slots[index] = Some(out?);
            }
            let missing = slots.iter().filter(|s| s.is_none()).count();
            if missing > 0 {
                return Err(BrokerError::Incomplete { name, missing });
            }
            let outputs: Vec<JobOutput> = slots.into_iter().flatten().collect();

            broker.execute(&name, &queue, payload, outputs).await
        })
    }

    async fn execute(
        &self,
        name: &str,
        queue: &str,
        payload: JobPayload,
        children: Vec<JobOutput>,
    ) -> Result<JobOutput, BrokerError> {
        let kind = payload.kind();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let handler = self.handler.clone();
            let p = payload.clone();
            let c = children.clone();
            let joined = tokio::spawn(async move { handler.handle(p, c).await }).await;
            match joined {
                Ok(out) => {
                    debug!(job = %name, queue = %queue, attempt, "job completed");
                    JOB_EXECUTIONS_TOTAL.with_label_values(&[kind, "ok"]).inc();
                    return Ok(out);
                }
                Err(e) if e.is_panic() && attempt < self.max_attempts => {
                    warn!(job = %name, queue = %queue, attempt, "job panicked; re-executing");
                    JOB_EXECUTIONS_TOTAL.with_label_values(&[kind, "retried"]).inc();
                }
                Err(e) => {
                    JOB_EXECUTIONS_TOTAL.with_label_values(&[kind, "failed"]).inc();
                    return Err(BrokerError::JobFailed {
                        name: name.to_string(),
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}
