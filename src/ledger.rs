//! Per-user token accounting.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::session_store::UserId;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("usage ledger I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("usage ledger is corrupt: {0}")]
    Format(#[from] serde_json::Error),
}

#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn record(
        &self,
        user_id: UserId,
        display_name: &str,
        tokens: u64,
    ) -> Result<(), LedgerError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub display_name: String,
    pub total_tokens: u64,
    pub requests: u64,
}

/// Cumulative usage per user, rewritten to a JSON file after every update.
pub struct JsonFileLedger {
    path: PathBuf,
    records: Mutex<BTreeMap<UserId, UsageRecord>>,
}

impl JsonFileLedger {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub(crate) async fn usage(&self, user_id: UserId) -> Option<UsageRecord> {
        self.records.lock().await.get(&user_id).cloned()
    }
}

#[async_trait]
impl UsageLedger for JsonFileLedger {
    async fn record(
        &self,
        user_id: UserId,
        display_name: &str,
        tokens: u64,
    ) -> Result<(), LedgerError> {
        let mut records = self.records.lock().await;
        let record = records.entry(user_id).or_default();
        record.display_name = display_name.to_string();
        record.total_tokens = record.total_tokens.saturating_add(tokens);
        record.requests += 1;

        let bytes = serde_json::to_vec_pretty(&*records)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
