//! Anchoring sealed tree heads to an external immutable medium.
//!
//! The [`AnchoringJob`] periodically seals the log and submits the new head
//! through an [`AnchorClient`]. Submission happens outside every log lock,
//! so a slow or failing medium never holds up appends; failed submissions
//! are retried with capped exponential backoff.

use crate::error::{LogError, Result};
use crate::log::TransparencyLog;
use crate::tree_head::SignedTreeHead;
use qlafs_core::{now_ms, TransparencyConfig};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What gets written to the anchoring medium
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorRecord {
    pub tree_size: u64,
    pub root_hash: String,
    pub timestamp: u64,
    pub signature: String,
    pub anchored_at: u64,
}

impl AnchorRecord {
    pub fn from_head(head: &SignedTreeHead) -> Self {
        Self {
            tree_size: head.tree_size,
            root_hash: head.root_hex(),
            timestamp: head.timestamp,
            signature: hex::encode(&head.signature),
            anchored_at: now_ms(),
        }
    }
}

/// External timestamping medium
pub trait AnchorClient: Send + Sync + 'static {
    /// Publish a head and return an opaque reference to where it landed
    fn submit(&self, head: &SignedTreeHead) -> impl Future<Output = Result<String>> + Send;
}

/// In-process medium with failure injection for tests
#[derive(Debug, Default)]
pub struct MemoryAnchor {
    records: Mutex<Vec<AnchorRecord>>,
    failures_remaining: AtomicU32,
}

impl MemoryAnchor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` submissions fail
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<AnchorRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AnchorClient for MemoryAnchor {
    fn submit(&self, head: &SignedTreeHead) -> impl Future<Output = Result<String>> + Send {
        let record = AnchorRecord::from_head(head);
        async move {
            let injected = self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(LogError::Anchor("injected anchor failure".to_string()));
            }
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            records.push(record);
            Ok(format!("memory:{}", records.len() - 1))
        }
    }
}

/// Append-only JSON-lines file; the reference is `path#line`
#[derive(Debug)]
pub struct FileAnchor {
    path: PathBuf,
    lines: tokio::sync::Mutex<u64>,
}

impl FileAnchor {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content.lines().filter(|l| !l.trim().is_empty()).count() as u64,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            lines: tokio::sync::Mutex::new(existing),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AnchorClient for FileAnchor {
    fn submit(&self, head: &SignedTreeHead) -> impl Future<Output = Result<String>> + Send {
        let record = AnchorRecord::from_head(head);
        async move {
            let mut line = serde_json::to_string(&record)?;
            line.push('\n');

            let mut lines = self.lines.lock().await;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.sync_data().await?;

            let reference = format!("{}#{}", self.path.display(), *lines);
            *lines += 1;
            Ok(reference)
        }
    }
}

/// Periodic seal-and-anchor task
pub struct AnchoringJob<A: AnchorClient> {
    log: Arc<TransparencyLog>,
    client: Arc<A>,
    interval: Duration,
    retry_base: Duration,
    retry_max: Duration,
    max_attempts: u32,
}

impl<A: AnchorClient> AnchoringJob<A> {
    pub fn new(log: Arc<TransparencyLog>, client: Arc<A>, config: &TransparencyConfig) -> Self {
        Self {
            log,
            client,
            interval: Duration::from_millis(config.anchor_interval_ms),
            retry_base: Duration::from_millis(config.anchor_retry_base_ms),
            retry_max: Duration::from_millis(config.anchor_retry_max_ms),
            max_attempts: config.anchor_max_attempts.max(1),
        }
    }

    /// Seal the log and anchor the head if it is new.
    ///
    /// Returns the anchored head, or `None` when there was nothing new to
    /// anchor.
    pub async fn anchor_once(&self) -> Result<Option<SignedTreeHead>> {
        if self.log.size() == 0 {
            return Ok(None);
        }
        let head = self.log.seal_tree_head()?;
        if head.anchor_reference.is_some() {
            return Ok(None);
        }

        let mut delay = self.retry_base;
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            match self.client.submit(&head).await {
                Ok(reference) => {
                    return self.log.record_anchor(head.tree_size, &reference).map(Some);
                }
                Err(e) => {
                    warn!(
                        tree_size = head.tree_size,
                        attempt,
                        error = %e,
                        "Anchor submission failed"
                    );
                    last_error = Some(e);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2).min(self.retry_max);
                    }
                }
            }
        }

        Err(LogError::Anchor(format!(
            "tree head at size {} not anchored after {} attempts: {}",
            head.tree_size,
            self.max_attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Run forever on the configured interval; abort the handle to stop
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = self.interval.as_millis() as u64, "Anchoring job started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.anchor_once().await {
                    Ok(Some(head)) => debug!(tree_size = head.tree_size, "Anchoring pass complete"),
                    Ok(None) => {}
                    // The head stays sealed without a reference; the next tick retries it
                    Err(e) => warn!(error = %e, "Anchoring pass failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::tests::verdict;
    use qlafs_consensus::Decision;
    use qlafs_core::generate_signing_key;

    fn config() -> TransparencyConfig {
        TransparencyConfig {
            anchor_interval_ms: 20,
            anchor_retry_base_ms: 1,
            anchor_retry_max_ms: 4,
            anchor_max_attempts: 3,
            ..TransparencyConfig::default()
        }
    }

    fn log_with(count: usize) -> Arc<TransparencyLog> {
        let log = Arc::new(TransparencyLog::in_memory(generate_signing_key()));
        for i in 0..count {
            log.append(&verdict(&format!("p-{}", i), "agent-1", Decision::Accept))
                .unwrap();
        }
        log
    }

    #[tokio::test]
    async fn test_anchor_once_records_reference() {
        let log = log_with(3);
        let anchor = Arc::new(MemoryAnchor::new());
        let job = AnchoringJob::new(log.clone(), anchor.clone(), &config());

        let head = job.anchor_once().await.unwrap().unwrap();
        assert_eq!(head.tree_size, 3);
        assert_eq!(head.anchor_reference.as_deref(), Some("memory:0"));
        assert_eq!(log.tree_head().unwrap().anchor_reference.as_deref(), Some("memory:0"));
        assert_eq!(anchor.records()[0].root_hash, head.root_hex());

        // Nothing new since the last pass
        assert!(job.anchor_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_log_is_not_anchored() {
        let log = log_with(0);
        let anchor = Arc::new(MemoryAnchor::new());
        let job = AnchoringJob::new(log.clone(), anchor.clone(), &config());
        assert!(job.anchor_once().await.unwrap().is_none());
        assert!(log.tree_head().is_none());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let log = log_with(2);
        let anchor = Arc::new(MemoryAnchor::new());
        anchor.fail_next(2);
        let job = AnchoringJob::new(log, anchor.clone(), &config());

        let head = job.anchor_once().await.unwrap().unwrap();
        assert!(head.anchor_reference.is_some());
        assert_eq!(anchor.records().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_leave_head_unanchored_and_log_writable() {
        let log = log_with(2);
        let anchor = Arc::new(MemoryAnchor::new());
        anchor.fail_next(10);
        let job = AnchoringJob::new(log.clone(), anchor.clone(), &config());

        assert!(matches!(job.anchor_once().await, Err(LogError::Anchor(_))));
        let head = log.tree_head().unwrap();
        assert_eq!(head.tree_size, 2);
        assert!(head.anchor_reference.is_none());

        assert!(log
            .append(&verdict("p-after", "agent-1", Decision::Accept))
            .is_ok());
    }

    #[tokio::test]
    async fn test_unanchored_head_is_retried_next_pass() {
        let log = log_with(1);
        let anchor = Arc::new(MemoryAnchor::new());
        anchor.fail_next(3);
        let job = AnchoringJob::new(log.clone(), anchor.clone(), &config());

        assert!(job.anchor_once().await.is_err());
        let head = job.anchor_once().await.unwrap().unwrap();
        assert_eq!(head.tree_size, 1);
        assert_eq!(log.tree_heads().len(), 1);
    }

    #[tokio::test]
    async fn test_file_anchor_appends_lines() {
        let path = std::env::temp_dir().join(format!("qlafs_anchor_{}.jsonl", uuid::Uuid::new_v4()));
        let anchor = FileAnchor::open(&path).await.unwrap();
        let key = generate_signing_key();

        let first = anchor
            .submit(&SignedTreeHead::sign(&key, 1, [1u8; 32], 10))
            .await
            .unwrap();
        let second = anchor
            .submit(&SignedTreeHead::sign(&key, 2, [2u8; 32], 20))
            .await
            .unwrap();
        assert!(first.ends_with("#0"));
        assert!(second.ends_with("#1"));

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let records: Vec<AnchorRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].tree_size, 2);

        // Reopening continues the line count
        let reopened = FileAnchor::open(&path).await.unwrap();
        let third = reopened
            .submit(&SignedTreeHead::sign(&key, 3, [3u8; 32], 30))
            .await
            .unwrap();
        assert!(third.ends_with("#2"));
    }

    #[tokio::test]
    async fn test_spawned_job_anchors_in_background() {
        let log = log_with(4);
        let anchor = Arc::new(MemoryAnchor::new());
        let handle = AnchoringJob::new(log.clone(), anchor.clone(), &config()).spawn();

        let anchored = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if log
                    .tree_head()
                    .is_some_and(|h| h.anchor_reference.is_some())
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        handle.abort();
        assert!(anchored.is_ok());
    }
}
