//! Per-queue alert decisions.
//!
//! A queue is either normal (`sending_number == 0`) or alerting. Going above
//! the threshold raises once; staying above re-raises only when the snooze
//! window has elapsed; going back to or below the threshold clears.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::state::AlertState;
use crate::validator::MonitorConfig;

pub const TEMPLATE_ABOVE: &str = "monitoring/queue-threshold-alert/above";
pub const TEMPLATE_BELOW: &str = "monitoring/queue-threshold-alert/below";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertAction {
    NoAction,
    RaiseAlert,
    ReraiseAlert,
    ClearAlert,
}

impl AlertAction {
    pub fn template_id(&self) -> Option<&'static str> {
        match self {
            AlertAction::NoAction => None,
            AlertAction::RaiseAlert | AlertAction::ReraiseAlert => Some(TEMPLATE_ABOVE),
            AlertAction::ClearAlert => Some(TEMPLATE_BELOW),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertAction::NoAction => "no_action",
            AlertAction::RaiseAlert => "raise_alert",
            AlertAction::ReraiseAlert => "reraise_alert",
            AlertAction::ClearAlert => "clear_alert",
        }
    }
}

impl std::fmt::Display for AlertAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What must happen to the persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTransition {
    Unchanged,
    Save(AlertState),
    Delete,
}

/// Values handed to the notification template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderContext {
    pub queue: String,
    pub threshold: u64,
    pub size: u64,
    pub sending_number: u32,
    /// Start of the streak; absent while the queue is normal.
    pub since: Option<DateTime<Utc>>,
}

impl RenderContext {
    pub fn to_context(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub transition: StateTransition,
    pub action: AlertAction,
    pub context: RenderContext,
}

#[derive(Debug, Clone, Copy)]
pub struct ThresholdEvaluator {
    threshold: u64,
    snooze_interval: Option<Duration>,
    notify_on_recovery: bool,
}

impl ThresholdEvaluator {
    pub fn new(threshold: u64, snooze_interval: Option<Duration>, notify_on_recovery: bool) -> Self {
        Self {
            threshold,
            snooze_interval,
            notify_on_recovery,
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::new(
            config.threshold(),
            config.snooze_interval(),
            config.notify_on_recovery(),
        )
    }

    /// Reminder `k` is due `k` snooze intervals after the streak started, so
    /// the gap between reminders grows with every one sent.
    pub fn snooze_due(&self, prior: &AlertState, now: DateTime<Utc>) -> bool {
        let Some(interval) = self.snooze_interval else {
            return false;
        };
        if !prior.is_alerting() {
            return false;
        }
        let wait_ms = interval
            .num_milliseconds()
            .saturating_mul(i64::from(prior.sending_number));
        let elapsed_ms = now.signed_duration_since(prior.since).num_milliseconds();
        elapsed_ms >= wait_ms
    }

    pub fn evaluate(
        &self,
        queue: &str,
        current_size: u64,
        prior: &AlertState,
        now: DateTime<Utc>,
    ) -> Evaluation {
        let is_alerting = prior.is_alerting();
        let above = current_size > self.threshold;

        let (transition, action, next) = if above && !is_alerting {
            let next = AlertState {
                since: now,
                sending_number: 1,
            };
            (StateTransition::Save(next), AlertAction::RaiseAlert, Some(next))
        } else if above && self.snooze_due(prior, now) {
            let next = AlertState {
                since: prior.since,
                sending_number: prior.sending_number.saturating_add(1),
            };
            (StateTransition::Save(next), AlertAction::ReraiseAlert, Some(next))
        } else if is_alerting && !above {
            let action = if self.notify_on_recovery {
                AlertAction::ClearAlert
            } else {
                AlertAction::NoAction
            };
            (StateTransition::Delete, action, None)
        } else {
            let current = is_alerting.then_some(*prior);
            (StateTransition::Unchanged, AlertAction::NoAction, current)
        };

        let since = match transition {
            StateTransition::Delete => Some(prior.since),
            _ => next.map(|state| state.since),
        };

        Evaluation {
            transition,
            action,
            context: RenderContext {
                queue: queue.to_string(),
                threshold: self.threshold,
                size: current_size,
                sending_number: next.map(|state| state.sending_number).unwrap_or(0),
                since,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn alerting(since: DateTime<Utc>, sending_number: u32) -> AlertState {
        AlertState {
            since,
            sending_number,
        }
    }

    #[test]
    fn quiet_queue_stays_quiet() {
        let evaluator = ThresholdEvaluator::new(100, Some(Duration::minutes(10)), true);
        for size in [0, 50, 100] {
            let result = evaluator.evaluate("q", size, &AlertState::normal(t(0)), t(0));
            assert_eq!(result.action, AlertAction::NoAction);
            assert_eq!(result.transition, StateTransition::Unchanged);
            assert_eq!(result.context.sending_number, 0);
            assert!(result.context.since.is_none());
        }
    }

    #[test]
    fn first_crossing_raises() {
        let evaluator = ThresholdEvaluator::new(100, None, true);
        let result = evaluator.evaluate("q", 101, &AlertState::normal(t(3)), t(3));
        assert_eq!(result.action, AlertAction::RaiseAlert);
        assert_eq!(result.transition, StateTransition::Save(alerting(t(3), 1)));
        assert_eq!(result.context.sending_number, 1);
        assert_eq!(result.context.since, Some(t(3)));
        assert_eq!(result.action.template_id(), Some(TEMPLATE_ABOVE));
    }

    #[test]
    fn no_reminder_before_snooze_window() {
        let evaluator = ThresholdEvaluator::new(100, Some(Duration::minutes(10)), true);
        let result = evaluator.evaluate("q", 150, &alerting(t(0), 1), t(9));
        assert_eq!(result.action, AlertAction::NoAction);
        assert_eq!(result.transition, StateTransition::Unchanged);
        assert_eq!(result.context.sending_number, 1);
    }

    #[test]
    fn reminder_waits_grow_linearly_from_streak_start() {
        let evaluator = ThresholdEvaluator::new(100, Some(Duration::minutes(10)), true);

        assert!(evaluator.snooze_due(&alerting(t(0), 1), t(10)));
        assert!(!evaluator.snooze_due(&alerting(t(0), 2), t(19)));
        assert!(evaluator.snooze_due(&alerting(t(0), 2), t(20)));
        assert!(!evaluator.snooze_due(&alerting(t(0), 3), t(29)));
        assert!(evaluator.snooze_due(&alerting(t(0), 3), t(30)));

        let result = evaluator.evaluate("q", 150, &alerting(t(0), 2), t(20));
        assert_eq!(result.action, AlertAction::ReraiseAlert);
        assert_eq!(result.transition, StateTransition::Save(alerting(t(0), 3)));
        assert_eq!(result.context.since, Some(t(0)));
    }

    #[test]
    fn without_snooze_an_alert_is_sent_once() {
        let evaluator = ThresholdEvaluator::new(100, None, true);
        let result = evaluator.evaluate("q", 500, &alerting(t(0), 1), t(10_000));
        assert_eq!(result.action, AlertAction::NoAction);
        assert_eq!(result.transition, StateTransition::Unchanged);
    }

    #[test]
    fn recovery_clears_and_notifies() {
        let evaluator = ThresholdEvaluator::new(100, Some(Duration::minutes(10)), true);
        let result = evaluator.evaluate("q", 100, &alerting(t(0), 3), t(45));
        assert_eq!(result.action, AlertAction::ClearAlert);
        assert_eq!(result.transition, StateTransition::Delete);
        assert_eq!(result.context.sending_number, 0);
        assert_eq!(result.context.since, Some(t(0)));
        assert_eq!(result.action.template_id(), Some(TEMPLATE_BELOW));
    }

    #[test]
    fn recovery_clears_silently_when_disabled() {
        let evaluator = ThresholdEvaluator::new(100, None, false);
        let result = evaluator.evaluate("q", 10, &alerting(t(0), 1), t(5));
        assert_eq!(result.action, AlertAction::NoAction);
        assert_eq!(result.transition, StateTransition::Delete);
    }

    #[test]
    fn huge_sending_numbers_do_not_overflow() {
        let evaluator = ThresholdEvaluator::new(1, Some(Duration::days(365)), true);
        let prior = alerting(t(0), u32::MAX);
        assert!(!evaluator.snooze_due(&prior, t(60)));
        let result = evaluator.evaluate("q", 2, &prior, t(60));
        assert_eq!(result.action, AlertAction::NoAction);
    }

    #[test]
    fn context_uses_template_keys() {
        let evaluator = ThresholdEvaluator::new(100, None, true);
        let result = evaluator.evaluate("orders", 120, &AlertState::normal(t(0)), t(0));
        let context = result.context.to_context();
        assert_eq!(context["queue"], "orders");
        assert_eq!(context["threshold"], 100);
        assert_eq!(context["size"], 120);
        assert_eq!(context["sendingNumber"], 1);
        assert_eq!(context["since"], "2024-01-01T00:00:00Z");
    }

    #[test]
    fn snooze_scenario_from_quiet_start() {
        let evaluator = ThresholdEvaluator::new(100, Some(Duration::minutes(10)), true);
        let mut state = AlertState::normal(t(0));
        let mut actions = Vec::new();
        for (minute, size) in [(0, 50), (5, 150), (12, 150), (25, 150)] {
            let result = evaluator.evaluate("q", size, &state, t(minute));
            match result.transition {
                StateTransition::Save(next) => state = next,
                StateTransition::Delete => state = AlertState::normal(t(minute)),
                StateTransition::Unchanged => {}
            }
            actions.push((result.action, result.context.sending_number));
        }
        assert_eq!(
            actions,
            vec![
                (AlertAction::NoAction, 0),
                (AlertAction::RaiseAlert, 1),
                (AlertAction::NoAction, 1),
                (AlertAction::ReraiseAlert, 2),
            ]
        );
        assert_eq!(state.since, t(5));
    }
}
