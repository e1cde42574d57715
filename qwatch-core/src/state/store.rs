use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{AlertState, KeyValueBackend, StateKey, StoreResult};

/// One persisted alert, as listed by [`StateStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredAlert {
    pub queue: String,
    pub key: String,
    pub state: AlertState,
}

/// Typed access to alert state on top of a raw key-value backend.
///
/// Reads never fail because of what is stored: a missing, truncated or
/// otherwise unreadable record loads as the normal state.
pub struct StateStore<B: ?Sized> {
    backend: Arc<B>,
    namespace: String,
}

impl<B: ?Sized> Clone for StateStore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            namespace: self.namespace.clone(),
        }
    }
}

impl<B: KeyValueBackend + ?Sized> StateStore<B> {
    pub fn new(backend: Arc<B>, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn key(&self, identity: &str, queue: &str) -> StateKey {
        StateKey::new(&self.namespace, identity, queue)
    }

    pub async fn load(&self, key: &StateKey, now: DateTime<Utc>) -> StoreResult<AlertState> {
        let Some(bytes) = self.backend.get(key.as_str()).await? else {
            return Ok(AlertState::normal(now));
        };
        match AlertState::decode(&bytes) {
            Some(state) => Ok(state),
            None => {
                tracing::warn!(
                    target: "state",
                    key = %key,
                    raw = %String::from_utf8_lossy(&bytes),
                    "discarding unreadable alert state"
                );
                Ok(AlertState::normal(now))
            }
        }
    }

    pub async fn save(&self, key: &StateKey, state: &AlertState) -> StoreResult<()> {
        let encoded = state.encode()?;
        self.backend.set(key.as_str(), &encoded).await?;
        tracing::debug!(
            target: "state",
            key = %key,
            sending_number = state.sending_number,
            "alert state saved"
        );
        Ok(())
    }

    pub async fn delete(&self, key: &StateKey) -> StoreResult<()> {
        self.backend.delete(key.as_str()).await?;
        tracing::debug!(target: "state", key = %key, "alert state deleted");
        Ok(())
    }

    pub async fn reset(&self, identity: &str, queue: &str) -> StoreResult<()> {
        self.delete(&self.key(identity, queue)).await
    }

    /// Lists alerting queues for one monitor identity. Unreadable records and
    /// records in the normal state are skipped.
    pub async fn list(&self, identity: &str) -> StoreResult<Vec<StoredAlert>> {
        let prefix = StateKey::prefix(&self.namespace, identity);
        let entries = self.backend.scan_prefix(&prefix).await?;
        let mut alerts = Vec::with_capacity(entries.len());
        for (key, bytes) in entries {
            let Some(state) = AlertState::decode(&bytes) else {
                tracing::warn!(target: "state", key = %key, "skipping unreadable alert state");
                continue;
            };
            if !state.is_alerting() {
                continue;
            }
            alerts.push(StoredAlert {
                queue: key[prefix.len()..].to_string(),
                key,
                state,
            });
        }
        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryBackend;
    use chrono::{Duration, TimeZone};

    fn store() -> StateStore<MemoryBackend> {
        StateStore::new(Arc::new(MemoryBackend::new()), "qwatch")
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = store();
        let key = store.key("nightly", "orders.prod");
        let state = AlertState {
            since: t0(),
            sending_number: 4,
        };
        store.save(&key, &state).await.unwrap();
        let loaded = store.load(&key, t0() + Duration::hours(1)).await.unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn missing_record_loads_as_normal() {
        let store = store();
        let loaded = store.load(&store.key("nightly", "idle"), t0()).await.unwrap();
        assert_eq!(loaded, AlertState::normal(t0()));
        assert!(!loaded.is_alerting());
    }

    #[tokio::test]
    async fn corrupt_records_load_as_normal() {
        let store = store();
        let key = store.key("nightly", "orders.prod");
        let corrupt: [&[u8]; 4] = [
            b"not json",
            br#"{"since":"2024-05-10T12:00:00+00:00"}"#,
            br#"{"since":"10/05/2024","sendingNumber":2}"#,
            &[0xff, 0xfe, 0x00],
        ];
        for raw in corrupt {
            store.backend().set(key.as_str(), raw).await.unwrap();
            let loaded = store.load(&key, t0()).await.unwrap();
            assert_eq!(loaded, AlertState::normal(t0()));
        }
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = store();
        let key = store.key("nightly", "orders.prod");
        store.delete(&key).await.unwrap();
        store
            .save(
                &key,
                &AlertState {
                    since: t0(),
                    sending_number: 1,
                },
            )
            .await
            .unwrap();
        store.reset("nightly", "orders.prod").await.unwrap();
        store.reset("nightly", "orders.prod").await.unwrap();
        assert!(store.backend().is_empty().await);
    }

    #[tokio::test]
    async fn list_is_scoped_to_identity() {
        let store = store();
        let alerting = AlertState {
            since: t0(),
            sending_number: 2,
        };
        store
            .save(&store.key("nightly", "orders.prod"), &alerting)
            .await
            .unwrap();
        store
            .save(&store.key("hourly", "orders.prod"), &alerting)
            .await
            .unwrap();
        store
            .save(&store.key("nightly", "quiet"), &AlertState::normal(t0()))
            .await
            .unwrap();
        store
            .backend()
            .set(store.key("nightly", "broken").as_str(), b"{")
            .await
            .unwrap();

        let listed = store.list("nightly").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].queue, "orders.prod");
        assert_eq!(listed[0].key, "qwatch:nightly:orders.prod");
        assert_eq!(listed[0].state, alerting);
    }
}
