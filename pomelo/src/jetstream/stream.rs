use std::time::Duration;

use chrono::{DateTime, Utc};
use pomelo_proto::Subject;
use serde::{Deserialize, Serialize};

use super::serde_util::{duration_nanos, nullable_u32, nullable_u64};

/// A durable stream as reported by the broker
#[derive(Debug, Deserialize)]
pub struct StreamInfo {
    pub config: StreamConfig,
    #[serde(rename = "created")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub state: StreamState,
}

/// Counters describing the stored portion of a stream
#[derive(Debug, Default, Deserialize)]
pub struct StreamState {
    #[serde(default)]
    pub messages: u64,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default, rename = "first_seq")]
    pub first_sequence: u64,
    #[serde(default, rename = "last_seq")]
    pub last_sequence: u64,
    #[serde(default)]
    pub consumer_count: u32,
}

/// The subset of a stream's configuration this client manages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<Subject>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default, with = "nullable_u32")]
    pub max_consumers: Option<u32>,
    #[serde(default, with = "nullable_u64", rename = "max_msgs")]
    pub max_messages: Option<u64>,
    #[serde(default, with = "nullable_u64")]
    pub max_bytes: Option<u64>,
    #[serde(default, with = "nullable_u32", rename = "max_msg_size")]
    pub max_message_size: Option<u32>,
    #[serde(default, with = "duration_nanos")]
    pub max_age: Duration,
    #[serde(default)]
    pub storage: StorageType,
    #[serde(default = "default_replicas")]
    pub num_replicas: u32,
    #[serde(default, rename = "discard")]
    pub discard_policy: DiscardPolicy,
    #[serde(
        default,
        with = "duration_nanos",
        skip_serializing_if = "Duration::is_zero"
    )]
    pub duplicate_window: Duration,
}

fn default_replicas() -> u32 {
    1
}

impl StreamConfig {
    /// A limits-retention, file-backed, single-replica stream
    #[must_use]
    pub fn new(name: impl Into<String>, subjects: Vec<Subject>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            subjects,
            retention: RetentionPolicy::default(),
            max_consumers: None,
            max_messages: None,
            max_bytes: None,
            max_message_size: None,
            max_age: Duration::ZERO,
            storage: StorageType::default(),
            num_replicas: 1,
            discard_policy: DiscardPolicy::default(),
            duplicate_window: Duration::ZERO,
        }
    }
}

/// When the broker may evict stored messages
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    #[default]
    Limits,
    Interest,
    WorkQueue,
}

/// What happens when a stream hits its limits
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardPolicy {
    #[default]
    Old,
    New,
}

/// The backing medium of a stream or consumer
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// Acknowledgement returned for a publish into a stream
#[derive(Debug, Clone, Deserialize)]
pub struct PublishAck {
    pub stream: String,
    #[serde(rename = "seq")]
    pub sequence: u64,
    #[serde(default)]
    pub duplicate: bool,
}
