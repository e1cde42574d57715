use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Persisted alerting status of one queue for one monitor.
///
/// `sending_number == 0` is the normal state and is equivalent to having no
/// record at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertState {
    pub since: DateTime<Utc>,
    pub sending_number: u32,
}

/// Wire form of [`AlertState`]: exactly two fields, timestamp as RFC 3339.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredAlertState {
    since: String,
    sending_number: u32,
}

impl AlertState {
    pub fn normal(now: DateTime<Utc>) -> Self {
        Self {
            since: now,
            sending_number: 0,
        }
    }

    pub fn is_alerting(&self) -> bool {
        self.sending_number > 0
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&StoredAlertState {
            since: self.since.to_rfc3339_opts(SecondsFormat::Secs, false),
            sending_number: self.sending_number,
        })
    }

    /// Returns `None` for anything that is not a complete, well-formed record.
    pub(crate) fn decode(bytes: &[u8]) -> Option<Self> {
        let stored: StoredAlertState = serde_json::from_slice(bytes).ok()?;
        let since = DateTime::parse_from_rfc3339(stored.since.trim())
            .ok()?
            .with_timezone(&Utc);
        Some(Self {
            since,
            sending_number: stored.sending_number,
        })
    }
}

/// Backend key for one (monitor identity, queue) pair:
/// `<namespace>:<identity>:<queue>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey(String);

impl StateKey {
    pub fn new(namespace: &str, identity: &str, queue: &str) -> Self {
        Self(format!("{}{}", Self::prefix(namespace, identity), queue))
    }

    pub fn prefix(namespace: &str, identity: &str) -> String {
        format!("{namespace}:{identity}:")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
