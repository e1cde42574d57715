//! Queue backlog monitoring with hysteresis and snoozed reminders.
//!
//! [`AlertRunner`] drives one evaluation pass: it lists queues from a
//! [`QueueEngine`], loads each queue's [`AlertState`] through a
//! [`StateStore`], lets the [`ThresholdEvaluator`] decide, persists the
//! result and hands notifications to a [`NotificationTransport`].

pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod notify;
pub mod runner;
pub mod sqlite;
pub mod state;
pub mod validator;

pub use config::{
    load_app_config, AppConfig, EngineSection, RawMonitorOptions, RunnerSection, StateSection,
    TransportSection, DEFAULT_NAMESPACE,
};
pub use engine::{
    EngineError, EngineResult, QueueEngine, SqliteQueueEngine, SqliteQueueEngineBuilder,
    StaticQueueEngine,
};
pub use error::{ConfigError, Result};
pub use evaluator::{
    AlertAction, Evaluation, RenderContext, StateTransition, ThresholdEvaluator, TEMPLATE_ABOVE,
    TEMPLATE_BELOW,
};
pub use notify::{
    transport_from_section, LogTransport, NotificationTransport, RecordingTransport,
    SentNotification, TransportError, TransportResult, WebhookTransport,
};
pub use runner::{
    AlertRunner, FailureStage, QueueFailure, RunError, RunReport, RunResult, DEFAULT_CONCURRENCY,
};
pub use state::{
    AlertState, KeyValueBackend, MemoryBackend, SqliteBackend, SqliteBackendBuilder, StateKey,
    StateStore, StoreError, StoreResult, StoredAlert,
};
pub use validator::{validate, MonitorConfig, QueuePattern, DEFAULT_IDENTITY};
