#![forbid(unsafe_code)]

use relay_workflow::{BatchFailurePolicy, ClaimGateConfig, CoordinatorConfig, PacingConfig};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayNodeConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub replica: ReplicaSection,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub durable: DurableSection,
    #[serde(default)]
    pub distribution: DistributionConfig,
    #[serde(default)]
    pub claims: ClaimsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_label")]
    pub label: String,
    /// Lease holder identity; defaults to the label.
    #[serde(default)]
    pub holder_id: Option<String>,
}

fn default_node_label() -> String {
    "relay-node".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            label: default_node_label(),
            holder_id: None,
        }
    }
}

impl NodeConfig {
    pub fn holder_id(&self) -> &str {
        self.holder_id.as_deref().unwrap_or(&self.label)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub operator_key: Option<String>,
    #[serde(default)]
    pub distribution_contract: String,
    #[serde(default)]
    pub registry_contract: String,
    #[serde(default)]
    pub read_state_path: Option<String>,
    #[serde(default)]
    pub interact_path: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplicaSection {
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_state_path")]
    pub state_path: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_state_path() -> String {
    "/contract?id={contract}".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistrySection {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub sale_path: String,
    #[serde(default)]
    pub owner_path: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Sales preloaded into the offline registry used by `--ledger-mode mock`.
    #[serde(default)]
    pub mock_sales: Vec<MockSale>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MockSale {
    pub device_serial: String,
    pub nft_id: u16,
    /// Address that currently holds the NFT.
    pub owner: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DurableSection {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub upload_path: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DistributionConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_persist_retries")]
    pub persist_retries: u32,
    #[serde(default = "default_summary_max_age_ms")]
    pub summary_max_age_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    #[serde(default = "default_job_attempts")]
    pub job_attempts: u32,
    #[serde(default)]
    pub pacing: PacingConfig,
}

fn default_batch_size() -> usize {
    relay_core::MAX_BATCH_SIZE
}

fn default_max_retries() -> u32 {
    6
}

fn default_persist_retries() -> u32 {
    3
}

fn default_summary_max_age_ms() -> u64 {
    2_500
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_polls() -> u32 {
    5
}

fn default_job_attempts() -> u32 {
    3
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            persist_retries: default_persist_retries(),
            summary_max_age_ms: default_summary_max_age_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_polls: default_max_polls(),
            job_attempts: default_job_attempts(),
            pacing: PacingConfig::default(),
        }
    }
}

impl DistributionConfig {
    pub fn coordinator_config(&self, distribution_contract: &str) -> CoordinatorConfig {
        CoordinatorConfig {
            distribution_contract: distribution_contract.to_string(),
            batch_size: self.batch_size,
            max_retries: self.max_retries,
            persist_retries: self.persist_retries,
            summary_max_age: Duration::from_millis(self.summary_max_age_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_polls: self.max_polls,
            job_attempts: self.job_attempts,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaimsConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_family_batch_size")]
    pub family_batch_size: usize,
    #[serde(default = "default_registry_max_age_ms")]
    pub max_age_ms: u64,
    #[serde(default)]
    pub failure_policy: BatchFailurePolicy,
    #[serde(default)]
    pub pacing: PacingConfig,
}

fn default_family_batch_size() -> usize {
    relay_core::FAMILY_BATCH_SIZE
}

fn default_registry_max_age_ms() -> u64 {
    60_000
}

impl Default for ClaimsConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            family_batch_size: default_family_batch_size(),
            max_age_ms: default_registry_max_age_ms(),
            failure_policy: BatchFailurePolicy::default(),
            pacing: PacingConfig::default(),
        }
    }
}

impl ClaimsConfig {
    pub fn claim_gate_config(&self, registry_contract: &str) -> ClaimGateConfig {
        ClaimGateConfig {
            registry_contract: registry_contract.to_string(),
            max_age: Duration::from_millis(self.max_age_ms),
            batch_size: self.batch_size,
            family_batch_size: self.family_batch_size,
            failure_policy: self.failure_policy,
        }
    }
}

/// Where the scheduler reads epoch scores from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedConfig {
    File {
        path: String,
    },
    Http {
        url: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Time between distribution epochs.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
    #[serde(default)]
    pub feed: Option<FeedConfig>,
}

fn default_interval_secs() -> u64 {
    3_600
}

fn default_tick_ms() -> u64 {
    5_000
}

fn default_lease_ms() -> u64 {
    30_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_interval_secs(),
            tick_ms: default_tick_ms(),
            lease_ms: default_lease_ms(),
            feed: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_dir")]
    pub db_dir: String,
}

fn default_db_dir() -> String {
    "relay_db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_dir: default_db_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind_address() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn resolve_env_refs(mut v: toml::Value) -> Result<toml::Value, String> {
    fn walk(v: &mut toml::Value) -> Result<(), String> {
        match v {
            toml::Value::String(s) => {
                if let Some(var) = s.strip_prefix("env:") {
                    let var = var.trim();
                    if var.is_empty() {
                        return Err("invalid env: reference (empty var name)".to_string());
                    }
                    let val = std::env::var(var)
                        .map_err(|_| format!("missing required environment variable: {var}"))?;
                    *s = val;
                }
            }
            toml::Value::Array(arr) => {
                for x in arr {
                    walk(x)?;
                }
            }
            toml::Value::Table(map) => {
                for (_, x) in map.iter_mut() {
                    walk(x)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    walk(&mut v)?;
    Ok(v)
}

pub fn load_config(path: &str) -> Result<RelayNodeConfig, String> {
    let raw = fs::read_to_string(path).map_err(|e| format!("failed to read config {path}: {e}"))?;
    parse_config(&raw).map_err(|e| format!("{path}: {e}"))
}

pub fn parse_config(raw: &str) -> Result<RelayNodeConfig, String> {
    let parsed: toml::Value = toml::from_str(raw).map_err(|e| format!("failed to parse config: {e}"))?;
    let resolved = resolve_env_refs(parsed)?;
    resolved
        .try_into::<RelayNodeConfig>()
        .map_err(|e| format!("failed to decode config: {e}"))
}

impl RelayNodeConfig {
    pub fn validate_for_mode_http(&self) -> Result<(), String> {
        if self.node.label.trim().is_empty() {
            return Err("node.label is empty".to_string());
        }
        let missing = [
            ("ledger.base_url", self.ledger.base_url.as_str()),
            ("ledger.distribution_contract", self.ledger.distribution_contract.as_str()),
            ("ledger.registry_contract", self.ledger.registry_contract.as_str()),
            ("replica.base_url", self.replica.base_url.as_str()),
            ("registry.base_url", self.registry.base_url.as_str()),
            ("registry.sale_path", self.registry.sale_path.as_str()),
            ("registry.owner_path", self.registry.owner_path.as_str()),
            ("durable.base_url", self.durable.base_url.as_str()),
            ("durable.upload_path", self.durable.upload_path.as_str()),
        ]
        .into_iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(k, _)| k)
        .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(format!("missing required settings: {}", missing.join(", ")));
        }
        if self.distribution.batch_size == 0 || self.claims.batch_size == 0 {
            return Err("batch sizes must be >= 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.node.label, "relay-node");
        assert_eq!(cfg.distribution.batch_size, 8);
        assert_eq!(cfg.distribution.max_retries, 6);
        assert_eq!(cfg.distribution.persist_retries, 3);
        assert_eq!(cfg.claims.family_batch_size, 4);
        assert_eq!(cfg.claims.failure_policy, BatchFailurePolicy::AbortRemaining);
        assert_eq!(cfg.distribution.pacing, PacingConfig::Fixed { delay_ms: 5_000 });
        assert!(!cfg.scheduler.enabled);
        assert_eq!(cfg.node.holder_id(), "relay-node");
    }

    #[test]
    fn env_refs_are_resolved_from_a_file() {
        std::env::set_var("RELAY_NODE_TEST_OPERATOR_KEY", "secret-key");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[ledger]
base_url = "http://ledger.local"
operator_key = "env:RELAY_NODE_TEST_OPERATOR_KEY"
distribution_contract = "dist"
registry_contract = "reg"

[claims]
failure_policy = "fail_batch_only"
pacing = {{ mode = "token_bucket", writes_per_minute = 30 }}

[scheduler]
enabled = true
feed = {{ kind = "file", path = "scores.json" }}
"#
        )
        .unwrap();

        let cfg = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.ledger.operator_key.as_deref(), Some("secret-key"));
        assert_eq!(cfg.claims.failure_policy, BatchFailurePolicy::FailBatchOnly);
        assert_eq!(
            cfg.claims.pacing,
            PacingConfig::TokenBucket {
                writes_per_minute: 30,
                burst: 1
            }
        );
        assert_eq!(
            cfg.scheduler.feed,
            Some(FeedConfig::File {
                path: "scores.json".to_string()
            })
        );
        let gate = cfg.claims.claim_gate_config(&cfg.ledger.registry_contract);
        assert_eq!(gate.registry_contract, "reg");
        assert_eq!(gate.max_age, Duration::from_secs(60));
    }

    #[test]
    fn missing_env_var_is_an_error() {
        let err = parse_config(
            r#"
[durable]
api_key = "env:RELAY_NODE_TEST_DEFINITELY_UNSET"
"#,
        )
        .unwrap_err();
        assert!(err.contains("RELAY_NODE_TEST_DEFINITELY_UNSET"));
    }

    #[test]
    fn http_mode_requires_collaborator_urls() {
        let cfg = parse_config("[ledger]\nbase_url = \"http://ledger.local\"\n").unwrap();
        let err = cfg.validate_for_mode_http().unwrap_err();
        assert!(err.contains("ledger.distribution_contract"));
        assert!(err.contains("durable.upload_path"));
    }
}
