//! Sources of epoch scores for the scheduler.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use relay_core::Score;

use crate::config::FeedConfig;

#[async_trait]
pub trait ScoreFeed: Send + Sync {
    async fn fetch_scores(&self) -> anyhow::Result<Vec<Score>>;
}

/// Reads a JSON array of scores from a file on every fetch.
#[derive(Debug, Clone)]
pub struct FileScoreFeed {
    path: PathBuf,
}

impl FileScoreFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ScoreFeed for FileScoreFeed {
    async fn fetch_scores(&self) -> anyhow::Result<Vec<Score>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read score feed {}", self.path.display()))?;
        parse_scores(&raw).with_context(|| format!("invalid score feed {}", self.path.display()))
    }
}

pub fn parse_scores(raw: &str) -> anyhow::Result<Vec<Score>> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(feature = "ledger-http")]
#[derive(Debug, Clone)]
pub struct HttpScoreFeed {
    url: String,
    client: reqwest::Client,
}

#[cfg(feature = "ledger-http")]
impl HttpScoreFeed {
    pub fn new(url: impl Into<String>, timeout_ms: Option<u64>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms.unwrap_or(10_000)))
            .build()
            .context("failed to build score feed client")?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[cfg(feature = "ledger-http")]
#[async_trait]
impl ScoreFeed for HttpScoreFeed {
    async fn fetch_scores(&self) -> anyhow::Result<Vec<Score>> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("score feed request to {} failed", self.url))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("score feed returned http status {status}");
        }
        Ok(resp.json().await.context("score feed body is not a score list")?)
    }
}

pub fn build_feed(cfg: &FeedConfig) -> anyhow::Result<Box<dyn ScoreFeed>> {
    match cfg {
        FeedConfig::File { path } => Ok(Box::new(FileScoreFeed::new(path))),
        #[cfg(feature = "ledger-http")]
        FeedConfig::Http { url, timeout_ms } => Ok(Box::new(HttpScoreFeed::new(url, *timeout_ms)?)),
        #[cfg(not(feature = "ledger-http"))]
        FeedConfig::Http { .. } => {
            anyhow::bail!("http score feed requires building with --features ledger-http")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_feed_reads_scores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scores.json");
        std::fs::write(
            &path,
            r#"[{"address":"0x0000000000000000000000000000000000000001","fingerprint":"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA","value":42}]"#,
        )
        .unwrap();

        let feed = build_feed(&FeedConfig::File {
            path: path.to_string_lossy().into_owned(),
        })
        .unwrap();
        let scores = feed.fetch_scores().await.unwrap();
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].value, 42);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let feed = FileScoreFeed::new("/nonexistent/relay-scores.json");
        let err = feed.fetch_scores().await.unwrap_err();
        assert!(err.to_string().contains("failed to read score feed"));
    }
}
