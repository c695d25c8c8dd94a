//! On-disk webhook spool.
//!
//! When the durable store cannot accept an uplink, the full envelope is
//! serialized to `pending/` and the webhook returns 202. A background
//! drainer moves files to `processing/` while replaying them, back to
//! `pending/` with a bumped attempt count on failure, and to
//! `dead-letter/` once the attempt budget is exhausted. Filenames embed
//! the receive time in zero-padded micros so lexicographic order is
//! arrival order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SpoolError;

/// Attempts before an envelope is moved to `dead-letter/`.
pub const MAX_ATTEMPTS: u32 = 5;

/// Retry backoff: 2ⁿ seconds, capped at 5 minutes.
#[must_use]
pub fn backoff(attempts: u32) -> Duration {
    let secs = 1u64.checked_shl(attempts).unwrap_or(u64::MAX).min(300);
    Duration::from_secs(secs)
}

/// A spooled webhook envelope, self-describing on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolEnvelope {
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    /// Relevant request headers (signature, timestamp, nonce, tenant hint).
    pub headers: BTreeMap<String, String>,
    /// Raw request body.
    pub body: String,
    pub remote_addr: Option<String>,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SpoolEnvelope {
    /// A fresh envelope for a request received now.
    #[must_use]
    pub fn new(
        received_at: DateTime<Utc>,
        headers: BTreeMap<String, String>,
        body: String,
        remote_addr: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            received_at,
            headers,
            body,
            remote_addr,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
        }
    }

    fn file_name(&self) -> String {
        let micros = self.received_at.timestamp_micros().max(0);
        format!("{micros:020}-{}.json", self.id.as_simple())
    }
}

/// A file currently claimed by the drainer.
#[derive(Debug)]
pub struct SpooledFile {
    pub path: PathBuf,
    pub envelope: SpoolEnvelope,
}

/// The spool directory tree.
#[derive(Debug, Clone)]
pub struct Spool {
    pending: PathBuf,
    processing: PathBuf,
    dead_letter: PathBuf,
}

impl Spool {
    /// Open (creating if needed) the spool rooted at `root`.
    ///
    /// Directories are created owner-only on unix.
    pub async fn open(root: &Path) -> Result<Self, SpoolError> {
        let spool = Self {
            pending: root.join("pending"),
            processing: root.join("processing"),
            dead_letter: root.join("dead-letter"),
        };
        for dir in [&spool.pending, &spool.processing, &spool.dead_letter] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| io_err(dir, e))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
                    .await
                    .map_err(|e| io_err(dir, e))?;
            }
        }
        Ok(spool)
    }

    /// Write a new envelope into `pending/`.
    pub async fn enqueue(&self, envelope: &SpoolEnvelope) -> Result<PathBuf, SpoolError> {
        let path = self.pending.join(envelope.file_name());
        let bytes = serde_json::to_vec_pretty(envelope)
            .map_err(|e| corrupt(&path, e.to_string()))?;
        tokio::fs::write(&path, bytes).await.map_err(|e| io_err(&path, e))?;
        Ok(path)
    }

    /// Claim up to `limit` due envelopes, oldest first, moving each into
    /// `processing/`.
    ///
    /// Envelopes whose `next_attempt_at` is still in the future are left
    /// alone. Unreadable files are skipped with a warning rather than
    /// wedging the drain.
    pub async fn take_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<SpooledFile>, SpoolError> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.pending)
            .await
            .map_err(|e| io_err(&self.pending, e))?;
        while let Some(entry) = dir.next_entry().await.map_err(|e| io_err(&self.pending, e))? {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(".json") {
                names.push(name);
            }
        }
        names.sort();

        let mut claimed = Vec::new();
        for name in names {
            if claimed.len() >= limit {
                break;
            }
            let src = self.pending.join(&name);
            let envelope = match read_envelope(&src).await {
                Ok(env) => env,
                Err(e) => {
                    tracing::warn!(path = %src.display(), error = %e, "skipping unreadable spool file");
                    continue;
                }
            };
            if envelope.next_attempt_at.is_some_and(|at| at > now) {
                continue;
            }
            let dst = self.processing.join(&name);
            tokio::fs::rename(&src, &dst).await.map_err(|e| io_err(&src, e))?;
            claimed.push(SpooledFile {
                path: dst,
                envelope,
            });
        }
        Ok(claimed)
    }

    /// The envelope was replayed successfully — remove it.
    pub async fn complete(&self, file: &SpooledFile) -> Result<(), SpoolError> {
        tokio::fs::remove_file(&file.path)
            .await
            .map_err(|e| io_err(&file.path, e))
    }

    /// The replay failed — bump attempts and requeue or bury.
    ///
    /// Returns `true` if the envelope went to `dead-letter/`.
    pub async fn fail(
        &self,
        file: SpooledFile,
        now: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, SpoolError> {
        let mut envelope = file.envelope;
        envelope.attempts = envelope.attempts.saturating_add(1);
        envelope.last_error = Some(error.to_owned());

        let buried = envelope.attempts >= MAX_ATTEMPTS;
        let target_dir = if buried { &self.dead_letter } else { &self.pending };
        if !buried {
            let delay = backoff(envelope.attempts);
            envelope.next_attempt_at =
                Some(now + chrono::TimeDelta::seconds(i64::try_from(delay.as_secs()).unwrap_or(300)));
        }

        let dst = target_dir.join(envelope.file_name());
        let bytes = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| corrupt(&dst, e.to_string()))?;
        tokio::fs::write(&dst, bytes).await.map_err(|e| io_err(&dst, e))?;
        tokio::fs::remove_file(&file.path)
            .await
            .map_err(|e| io_err(&file.path, e))?;
        Ok(buried)
    }

    /// Move any files stranded in `processing/` (e.g. by a crash) back to
    /// `pending/`. Called once at startup.
    pub async fn recover(&self) -> Result<usize, SpoolError> {
        let mut recovered = 0;
        let mut dir = tokio::fs::read_dir(&self.processing)
            .await
            .map_err(|e| io_err(&self.processing, e))?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| io_err(&self.processing, e))?
        {
            let src = entry.path();
            let dst = self.pending.join(entry.file_name());
            tokio::fs::rename(&src, &dst).await.map_err(|e| io_err(&src, e))?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Number of files waiting in `pending/`.
    pub async fn pending_count(&self) -> Result<usize, SpoolError> {
        let mut count = 0;
        let mut dir = tokio::fs::read_dir(&self.pending)
            .await
            .map_err(|e| io_err(&self.pending, e))?;
        while let Some(_entry) = dir.next_entry().await.map_err(|e| io_err(&self.pending, e))? {
            count += 1;
        }
        Ok(count)
    }
}

async fn read_envelope(path: &Path) -> Result<SpoolEnvelope, SpoolError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| io_err(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| corrupt(path, e.to_string()))
}

fn io_err(path: &Path, source: std::io::Error) -> SpoolError {
    SpoolError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn corrupt(path: &Path, reason: String) -> SpoolError {
    SpoolError::Corrupt {
        path: path.display().to_string(),
        reason,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn envelope_at(secs: i64) -> SpoolEnvelope {
        let mut headers = BTreeMap::new();
        headers.insert("x-parklane-nonce".to_owned(), "n1".to_owned());
        SpoolEnvelope::new(
            DateTime::from_timestamp(secs, 0).unwrap(),
            headers,
            r#"{"deveui":"70B3D57ED0001234"}"#.to_owned(),
            Some("10.0.0.1:4000".to_owned()),
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(2), Duration::from_secs(4));
        assert_eq!(backoff(3), Duration::from_secs(8));
        assert_eq!(backoff(8), Duration::from_secs(256));
        assert_eq!(backoff(9), Duration::from_secs(300));
        assert_eq!(backoff(40), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn enqueue_then_take_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::open(dir.path()).await.unwrap();
        let env = envelope_at(1_700_000_000);
        spool.enqueue(&env).await.unwrap();

        let now = DateTime::from_timestamp(1_700_000_100, 0).unwrap();
        let claimed = spool.take_due(10, now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].envelope, env);
        assert_eq!(spool.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn take_due_is_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::open(dir.path()).await.unwrap();
        spool.enqueue(&envelope_at(1_700_000_300)).await.unwrap();
        spool.enqueue(&envelope_at(1_700_000_100)).await.unwrap();
        spool.enqueue(&envelope_at(1_700_000_200)).await.unwrap();

        let now = DateTime::from_timestamp(1_700_001_000, 0).unwrap();
        let claimed = spool.take_due(10, now).await.unwrap();
        let times: Vec<i64> = claimed
            .iter()
            .map(|f| f.envelope.received_at.timestamp())
            .collect();
        assert_eq!(times, vec![1_700_000_100, 1_700_000_200, 1_700_000_300]);
    }

    #[tokio::test]
    async fn failed_envelope_requeues_with_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::open(dir.path()).await.unwrap();
        spool.enqueue(&envelope_at(1_700_000_000)).await.unwrap();

        let now = DateTime::from_timestamp(1_700_000_100, 0).unwrap();
        let claimed = spool.take_due(10, now).await.unwrap().pop().unwrap();
        let buried = spool.fail(claimed, now, "db down").await.unwrap();
        assert!(!buried);

        // Not yet due — backoff in effect.
        assert!(spool.take_due(10, now).await.unwrap().is_empty());
        assert_eq!(spool.pending_count().await.unwrap(), 1);

        // Due after the backoff passes.
        let later = now + chrono::TimeDelta::seconds(3);
        let retried = spool.take_due(10, later).await.unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].envelope.attempts, 1);
        assert_eq!(retried[0].envelope.last_error.as_deref(), Some("db down"));
    }

    #[tokio::test]
    async fn exhausted_attempts_bury_the_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::open(dir.path()).await.unwrap();
        let mut env = envelope_at(1_700_000_000);
        env.attempts = MAX_ATTEMPTS - 1;
        spool.enqueue(&env).await.unwrap();

        let now = DateTime::from_timestamp(1_700_000_100, 0).unwrap();
        let claimed = spool.take_due(10, now).await.unwrap().pop().unwrap();
        let buried = spool.fail(claimed, now, "still down").await.unwrap();
        assert!(buried);
        assert_eq!(spool.pending_count().await.unwrap(), 0);
        assert!(
            dir.path()
                .join("dead-letter")
                .read_dir()
                .unwrap()
                .next()
                .is_some()
        );
    }

    #[tokio::test]
    async fn recover_requeues_stranded_processing_files() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::open(dir.path()).await.unwrap();
        spool.enqueue(&envelope_at(1_700_000_000)).await.unwrap();
        let now = DateTime::from_timestamp(1_700_000_100, 0).unwrap();
        let _claimed = spool.take_due(10, now).await.unwrap();

        // Simulate a crash: the claimed file is stuck in processing/.
        let reopened = Spool::open(dir.path()).await.unwrap();
        assert_eq!(reopened.recover().await.unwrap(), 1);
        assert_eq!(reopened.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn complete_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::open(dir.path()).await.unwrap();
        spool.enqueue(&envelope_at(1_700_000_000)).await.unwrap();
        let now = DateTime::from_timestamp(1_700_000_100, 0).unwrap();
        let claimed = spool.take_due(10, now).await.unwrap().pop().unwrap();
        spool.complete(&claimed).await.unwrap();
        assert_eq!(spool.pending_count().await.unwrap(), 0);
        assert!(spool.take_due(10, now).await.unwrap().is_empty());
    }
}
