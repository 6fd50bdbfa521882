use std::time::Duration;

use chrono::{DateTime, Utc};
use pomelo_proto::Subject;
use serde::{Deserialize, Serialize};

use super::serde_util::{duration_nanos, nullable_u64};

/// A consumer as reported by the broker
#[derive(Debug, Deserialize)]
pub struct ConsumerInfo {
    pub stream_name: String,
    pub name: String,
    #[serde(rename = "created")]
    pub created_at: DateTime<Utc>,
    pub config: ConsumerConfig,
    #[serde(default)]
    pub num_pending: u64,
    #[serde(default)]
    pub num_ack_pending: u64,
    #[serde(default)]
    pub num_waiting: u32,
    #[serde(default)]
    pub delivered: Option<SequencePair>,
}

/// Matching consumer and stream positions of a delivery cursor
#[derive(Debug, Copy, Clone, Default, Deserialize)]
pub struct SequencePair {
    #[serde(rename = "consumer_seq")]
    pub consumer: u64,
    #[serde(rename = "stream_seq")]
    pub stream: u64,
}

/// The subset of a consumer's configuration this client manages
///
/// `deliver_subject` turns the consumer into a push consumer; pull
/// consumers, the only kind this client consumes from, leave it unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub durable_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_subject: Option<Subject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<Subject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter_subjects: Vec<Subject>,
    #[serde(flatten)]
    pub deliver_policy: DeliverPolicy,
    #[serde(default)]
    pub ack_policy: AckPolicy,
    #[serde(
        default,
        with = "duration_nanos",
        skip_serializing_if = "Duration::is_zero"
    )]
    pub ack_wait: Duration,
    #[serde(default, with = "nullable_u64", skip_serializing_if = "Option::is_none")]
    pub max_deliver: Option<u64>,
    #[serde(default)]
    pub replay_policy: ReplayPolicy,
    #[serde(
        default,
        with = "duration_nanos",
        skip_serializing_if = "Duration::is_zero"
    )]
    pub inactive_threshold: Duration,
    #[serde(default)]
    pub num_replicas: u32,
    #[serde(default, rename = "mem_storage", skip_serializing_if = "is_false")]
    pub memory_storage: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub headers_only: bool,
}

#[expect(
    clippy::trivially_copy_pass_by_ref,
    reason = "serde requires this signature"
)]
fn is_false(value: &bool) -> bool {
    !*value
}

/// Where in the stream the consumer's cursor starts
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "deliver_policy", rename_all = "snake_case")]
pub enum DeliverPolicy {
    #[default]
    All,
    Last,
    New,
    LastPerSubject,
    ByStartSequence {
        #[serde(rename = "opt_start_seq")]
        start_sequence: u64,
    },
    ByStartTime {
        #[serde(rename = "opt_start_time")]
        start_time: DateTime<Utc>,
    },
}

/// How deliveries must be acknowledged
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    None,
    All,
    #[default]
    Explicit,
}

/// The pacing of replayed messages
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPolicy {
    #[default]
    Instant,
    Original,
}

/// Metadata encoded in the reply subject of a stream delivery
///
/// `$JS.ACK.<stream>.<consumer>.<delivered>.<stream seq>.<consumer
/// seq>.<timestamp>.<pending>`, with two extra leading tokens on
/// domain-qualified deployments.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AckInfo {
    pub delivered: u64,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    pub pending: u64,
}

impl AckInfo {
    /// Parse the metadata out of a delivery's reply subject.
    ///
    /// Returns `None` if the subject is not an acknowledgement
    /// subject.
    #[must_use]
    pub fn parse(reply_subject: &Subject) -> Option<Self> {
        let tokens = reply_subject.split('.').collect::<Vec<_>>();
        let numbers = match (tokens.first(), tokens.get(1), tokens.len()) {
            (Some(&"$JS"), Some(&"ACK"), 9) => &tokens[4..9],
            // <domain>.<account hash> qualified form
            (Some(&"$JS"), Some(&"ACK"), 11..) => &tokens[6..11],
            _ => return None,
        };

        let mut parsed = numbers.iter().map(|token| token.parse::<u64>().ok());
        Some(Self {
            delivered: parsed.next()??,
            stream_sequence: parsed.next()??,
            consumer_sequence: parsed.next()??,
            pending: {
                // Skip the timestamp token
                let _timestamp = parsed.next()??;
                parsed.next()??
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use claims::{assert_none, assert_some_eq};
    use pomelo_proto::Subject;

    use super::{AckInfo, AckPolicy, ConsumerConfig, DeliverPolicy};

    #[test]
    fn config_serializes_the_flattened_deliver_policy() {
        let config = ConsumerConfig {
            name: "worker".to_owned(),
            deliver_policy: DeliverPolicy::ByStartSequence { start_sequence: 42 },
            ack_policy: AckPolicy::None,
            num_replicas: 1,
            memory_storage: true,
            ..ConsumerConfig::default()
        };

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!("by_start_sequence", json["deliver_policy"]);
        assert_eq!(42, json["opt_start_seq"]);
        assert_eq!("none", json["ack_policy"]);
        assert_eq!(true, json["mem_storage"]);
        assert!(json.get("durable_name").is_none());
        assert!(json.get("deliver_subject").is_none());
    }

    #[test]
    fn config_deserializes() {
        let config = serde_json::from_str::<ConsumerConfig>(
            r#"{
                "durable_name": "worker",
                "deliver_policy": "all",
                "ack_policy": "explicit",
                "ack_wait": 30000000000,
                "max_deliver": -1,
                "replay_policy": "instant",
                "num_replicas": 3
            }"#,
        )
        .unwrap();

        assert_eq!("worker", config.durable_name);
        assert_eq!(DeliverPolicy::All, config.deliver_policy);
        assert_eq!(AckPolicy::Explicit, config.ack_policy);
        assert_eq!(std::time::Duration::from_secs(30), config.ack_wait);
        assert_eq!(None, config.max_deliver);
    }

    #[test]
    fn parse_ack_subject() {
        let subject = Subject::from_static("$JS.ACK.ORDERS.worker.1.7.3.1700000000000000000.12");
        assert_some_eq!(
            AckInfo::parse(&subject),
            AckInfo {
                delivered: 1,
                stream_sequence: 7,
                consumer_sequence: 3,
                pending: 12,
            }
        );
    }

    #[test]
    fn parse_domain_qualified_ack_subject() {
        let subject = Subject::from_static(
            "$JS.ACK.hub.acct123.ORDERS.worker.1.7.3.1700000000000000000.12.4",
        );
        assert_some_eq!(
            AckInfo::parse(&subject),
            AckInfo {
                delivered: 1,
                stream_sequence: 7,
                consumer_sequence: 3,
                pending: 12,
            }
        );
    }

    #[test]
    fn reject_foreign_reply_subjects() {
        assert_none!(AckInfo::parse(&Subject::from_static("_INBOX.abc.def")));
        assert_none!(AckInfo::parse(&Subject::from_static("$JS.ACK.too.short")));
    }
}
