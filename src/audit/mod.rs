//! Audit trail for workflow events
//!
//! Every handled event is recorded with the hash of the context snapshot the
//! agents saw, so a run can be checked against the records it was built from.

use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Records kept before the oldest are evicted.
pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub audit_id: Uuid,
    pub user_id: String,
    /// Event name, e.g. `paycheck` or `respond:budget:approved`.
    pub event: String,
    pub context_snapshot_hash: String,
    /// Proposals created or transitioned while handling the event.
    pub proposal_ids: Vec<Uuid>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}

#[derive(Default)]
struct Records {
    by_id: HashMap<Uuid, AuditRecord>,
    /// Insertion order, oldest at the front.
    order: VecDeque<Uuid>,
}

/// Bounded in-process audit trail storage
pub struct AuditLog {
    records: Arc<RwLock<Records>>,
    capacity: usize,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY)
    }

    /// Keep at most `capacity` records (minimum 1), evicting the oldest.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(Records::default())),
            capacity: capacity.max(1),
        }
    }

    /// Store an audit record
    pub async fn record(&self, record: AuditRecord) -> Result<Uuid> {
        let audit_id = record.audit_id;
        let mut records = self.records.write().await;

        if records.by_id.insert(audit_id, record).is_none() {
            records.order.push_back(audit_id);
        }
        while records.order.len() > self.capacity {
            if let Some(evicted) = records.order.pop_front() {
                records.by_id.remove(&evicted);
                debug!(audit_id = %evicted, "Evicted oldest audit record");
            }
        }

        Ok(audit_id)
    }

    pub async fn get(&self, audit_id: Uuid) -> Result<Option<AuditRecord>> {
        let records = self.records.read().await;
        Ok(records.by_id.get(&audit_id).cloned())
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.order.len()
    }

    /// All retained records for a user, oldest first
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<AuditRecord>> {
        let records = self.records.read().await;

        let mut items: Vec<AuditRecord> = records
            .by_id
            .values()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect();

        items.sort_by_key(|record| record.created_at);

        Ok(items)
    }

    /// Check a stored record against the snapshot it claims to have seen.
    pub async fn verify_integrity<T: Serialize>(&self, audit_id: Uuid, snapshot: &T) -> Result<bool> {
        let records = self.records.read().await;

        Ok(records
            .by_id
            .get(&audit_id)
            .map(|record| compute_context_hash(snapshot) == record.context_snapshot_hash)
            .unwrap_or(false))
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 of a value's JSON form, streamed straight into the hasher.
pub fn compute_context_hash<T: Serialize>(value: &T) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), value).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(user_id: &str, hash: String) -> AuditRecord {
        AuditRecord {
            audit_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            event: "paycheck".to_string(),
            context_snapshot_hash: hash,
            proposal_ids: vec![],
            success: true,
            error: None,
            created_at: Utc::now(),
            execution_time_ms: 3,
        }
    }

    #[test]
    fn test_hash_is_stable() {
        let snapshot = json!({"userId": "u1", "debts": []});
        let a = compute_context_hash(&snapshot);
        assert_eq!(a.len(), 64);
        assert_eq!(a, compute_context_hash(&snapshot));
        assert_ne!(a, compute_context_hash(&json!({"userId": "u2", "debts": []})));
    }

    #[tokio::test]
    async fn test_record_and_verify() {
        let log = AuditLog::new();
        let snapshot = json!({"userId": "u1"});
        let id = log
            .record(record("u1", compute_context_hash(&snapshot)))
            .await
            .unwrap();
        log.record(record("u2", String::new())).await.unwrap();

        assert!(log.verify_integrity(id, &snapshot).await.unwrap());
        assert!(!log.verify_integrity(id, &json!({"userId": "tampered"})).await.unwrap());
        assert!(!log.verify_integrity(Uuid::new_v4(), &snapshot).await.unwrap());
        assert_eq!(log.list_for_user("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let log = AuditLog::with_capacity(2);
        let first = log.record(record("u1", String::new())).await.unwrap();
        let second = log.record(record("u1", String::new())).await.unwrap();
        let third = log.record(record("u1", String::new())).await.unwrap();

        assert_eq!(log.len().await, 2);
        assert!(log.get(first).await.unwrap().is_none());
        assert!(log.get(second).await.unwrap().is_some());
        assert!(log.get(third).await.unwrap().is_some());
        assert_eq!(log.list_for_user("u1").await.unwrap().len(), 2);
    }
}
