//! Turns loosely typed monitor options into an immutable [`MonitorConfig`].

use std::fmt;

use chrono::Duration;
use regex::{Regex, RegexBuilder};
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::config::RawMonitorOptions;
use crate::error::{ConfigError, Result};

pub const DEFAULT_IDENTITY: &str = "queue-threshold-alert";

const PATTERN_DELIMITERS: &[char] = &['/', '#', '~', '!', '@', '%', '|', '+'];
const PATTERN_MODIFIERS: &str = "imsxu";

/// A compiled queue-name predicate.
///
/// Accepts plain regex syntax (`orders\..*`) as well as the delimited form
/// (`/orders\..*/i`) with `i`, `m`, `s`, `x` and `u` flags. Anything after
/// the closing delimiter that is not a modifier makes the whole string a
/// plain regex, so `/orders/prod` matches that path literally.
#[derive(Debug, Clone)]
pub struct QueuePattern {
    source: String,
    regex: Option<Regex>,
}

impl QueuePattern {
    pub fn match_all() -> Self {
        Self {
            source: "/.*/".to_string(),
            regex: None,
        }
    }

    pub fn parse(field: &'static str, pattern: &str) -> Result<Self> {
        let invalid = |reason: String| ConfigError::InvalidPattern {
            field,
            pattern: pattern.to_string(),
            reason,
        };

        let (body, flags) = split_delimited(pattern).unwrap_or((pattern, ""));
        let mut builder = RegexBuilder::new(body);
        for flag in flags.chars() {
            match flag {
                'i' => builder.case_insensitive(true),
                'm' => builder.multi_line(true),
                's' => builder.dot_matches_new_line(true),
                'x' => builder.ignore_whitespace(true),
                'u' => builder.unicode(true),
                _ => continue,
            };
        }
        let regex = builder.build().map_err(|err| invalid(err.to_string()))?;
        Ok(Self {
            source: pattern.to_string(),
            regex: Some(regex),
        })
    }

    pub fn is_match(&self, queue: &str) -> bool {
        self.regex
            .as_ref()
            .map(|regex| regex.is_match(queue))
            .unwrap_or(true)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for QueuePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for QueuePattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

fn split_delimited(pattern: &str) -> Option<(&str, &str)> {
    let delimiter = pattern.chars().next()?;
    if !PATTERN_DELIMITERS.contains(&delimiter) {
        return None;
    }
    let rest = &pattern[delimiter.len_utf8()..];
    let end = rest.rfind(delimiter)?;
    let flags = &rest[end + delimiter.len_utf8()..];
    if !flags.chars().all(|c| PATTERN_MODIFIERS.contains(c)) {
        return None;
    }
    Some((&rest[..end], flags))
}

/// Validated options for one monitor. Built once per run and never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorConfig {
    identity: String,
    include: QueuePattern,
    exclude: Option<QueuePattern>,
    threshold: u64,
    snooze_minutes: Option<u32>,
    notify_on_recovery: bool,
}

impl MonitorConfig {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn snooze_minutes(&self) -> Option<u32> {
        self.snooze_minutes
    }

    pub fn snooze_interval(&self) -> Option<Duration> {
        self.snooze_minutes
            .map(|minutes| Duration::minutes(i64::from(minutes)))
    }

    pub fn notify_on_recovery(&self) -> bool {
        self.notify_on_recovery
    }

    pub fn include(&self) -> &QueuePattern {
        &self.include
    }

    pub fn exclude(&self) -> Option<&QueuePattern> {
        self.exclude.as_ref()
    }

    /// A queue is monitored when it matches the include pattern and does not
    /// match the exclude pattern.
    pub fn matches(&self, queue: &str) -> bool {
        self.include.is_match(queue)
            && !self
                .exclude
                .as_ref()
                .map(|pattern| pattern.is_match(queue))
                .unwrap_or(false)
    }
}

pub fn validate(raw: &RawMonitorOptions) -> Result<MonitorConfig> {
    let identity = match raw.identity.as_deref().map(str::trim) {
        None => DEFAULT_IDENTITY.to_string(),
        Some(value) if value.is_empty() || value.contains(':') => {
            return Err(ConfigError::InvalidIdentity(value.to_string()))
        }
        Some(value) => value.to_string(),
    };

    let include = match raw.queues.as_deref() {
        Some(pattern) => QueuePattern::parse("queues", pattern)?,
        None => QueuePattern::match_all(),
    };
    let exclude = raw
        .excluded_queues
        .as_deref()
        .map(|pattern| QueuePattern::parse("excluded_queues", pattern))
        .transpose()?;

    let threshold = raw
        .threshold
        .as_ref()
        .and_then(coerce_positive_int)
        .ok_or_else(|| ConfigError::InvalidThreshold(describe(raw.threshold.as_ref())))?;

    let snooze_minutes = raw
        .snooze_minute_delay
        .as_ref()
        .filter(|value| !value.is_null())
        .map(|value| {
            coerce_positive_int(value)
                .and_then(|minutes| u32::try_from(minutes).ok())
                .ok_or_else(|| ConfigError::InvalidSnoozeDelay(describe(Some(value))))
        })
        .transpose()?;

    let notify_on_recovery = match raw.notify_on_recovery.as_ref() {
        None | Some(Value::Null) => true,
        Some(value) => coerce_bool(value)
            .ok_or_else(|| ConfigError::InvalidRecoveryFlag(describe(Some(value))))?,
    };

    Ok(MonitorConfig {
        identity,
        include,
        exclude,
        threshold,
        snooze_minutes,
        notify_on_recovery,
    })
}

fn coerce_positive_int(value: &Value) -> Option<u64> {
    let parsed = match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed.filter(|value| *value > 0)
}

fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => match number.as_u64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => Some(true),
            "0" | "false" | "off" | "no" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn describe(value: Option<&Value>) -> String {
    match value {
        None => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}
