// Chatwatch Library - alert classification, deduplication and delivery
//
// Polls chat channels, decides which messages are operationally significant,
// suppresses duplicates and routes the survivors to notification sinks.

pub mod classifier;
pub mod config;
pub mod db_path;
pub mod digest;
pub mod error;
pub mod llm;
pub mod model;
pub mod monitor;
pub mod notify;
pub mod source;
pub mod store;
pub mod text;

pub use classifier::{Classification, HeuristicClassifier};
pub use config::{DigestConfig, LlmConfig, NotificationsConfig, RealtimeConfig, RuntimeConfig, SlackConfig, WhatsAppConfig};
pub use digest::{render_digest, DigestGenerator, DigestOutcome};
pub use error::{MonitorError, Result};
pub use llm::{parse_severity_reply, render_triage_prompt, LlmClient, LlmError, OpenAiCompatibleClient};
pub use model::{AlertDecision, AlertRecord, AlertStatistics, ChannelRule, SeverityLevel, SourceMessage};
pub use monitor::{CycleReport, MonitorCapabilities, RealtimeMonitor, SeenCache};
pub use notify::{Destinations, NotificationRouter, WhatsAppCredentials};
pub use source::{ChatPoster, MessageSource, SlackClient};
pub use store::AlertStore;
pub use text::{compute_content_hash, normalize_text};
