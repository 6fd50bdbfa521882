//! Durable stream layer: typed admin API, publish acknowledgements
//! and the credit-managed pull consumer.
//!
//! Built entirely on the core request/reply plumbing; every admin
//! operation is a JSON request under the `$JS.API.` subject namespace.

use std::{fmt::Display, time::Duration};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use tracing::debug;

pub use self::consumer::{
    AckInfo, AckPolicy, ConsumerConfig, ConsumerInfo, DeliverPolicy, ReplayPolicy, SequencePair,
};
pub use self::ordered::OrderedMessages;
pub use self::pull::{
    ConsumerEvent, Fetch, Messages, Notifications, PullConsumer, PullSettings,
};
pub use self::stream::{
    DiscardPolicy, PublishAck, RetentionPolicy, StorageType, StreamConfig, StreamInfo, StreamState,
};

use crate::{
    client::Client,
    error::{PublishError, RequestError},
};

mod consumer;
mod ordered;
mod pull;
mod serde_util;
mod stream;

pub mod error {
    //! Durable stream layer errors

    pub use super::pull::ConsumerError;
    pub use super::{ApiError, JetStreamError};
}

const DEFAULT_API_PREFIX: &str = "$JS.API";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A handle to the durable stream API of a [`Client`]'s broker
///
/// `Clone`able; all clones share the underlying client.
#[derive(Debug, Clone)]
pub struct JetStream {
    client: Client,
    prefix: String,
    request_timeout: Duration,
}

/// An error object returned by the admin API
#[derive(Debug, Clone, Deserialize, thiserror::Error)]
#[error("api error {code} (err_code {err_code}): {description}")]
pub struct ApiError {
    pub code: u16,
    #[serde(default)]
    pub err_code: u32,
    #[serde(default)]
    pub description: String,
}

impl ApiError {
    pub const STREAM_NOT_FOUND: u32 = 10059;
    pub const CONSUMER_NOT_FOUND: u32 = 10014;
    pub const STREAM_NAME_IN_USE: u32 = 10058;
    pub const CONSUMER_NAME_IN_USE: u32 = 10148;

    /// Whether the error means the addressed resource does not exist
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.err_code,
            Self::STREAM_NOT_FOUND | Self::CONSUMER_NOT_FOUND
        )
    }
}

/// An error encountered while talking to the admin API
#[derive(Debug, thiserror::Error)]
pub enum JetStreamError {
    #[error("resource name produces an invalid subject")]
    Subject(#[source] pomelo_proto::error::SubjectError),
    #[error("request could not be published")]
    Publish(#[source] PublishError),
    #[error("request failed")]
    Request(#[source] RequestError),
    #[error("response could not be decoded")]
    Json(#[source] serde_json::Error),
    #[error("stored message payload is not valid base64")]
    Payload(#[source] data_encoding::DecodeError),
    #[error("the api rejected the request")]
    Api(#[source] ApiError),
}

impl JetStreamError {
    /// Whether the failure was a not-found api error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api(err) if err.is_not_found())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ApiResponse<T> {
    Error { error: ApiError },
    Ok(T),
}

#[derive(Debug, Deserialize)]
struct SuccessResponse {
    #[serde(default)]
    success: bool,
}

#[derive(Debug, Deserialize)]
struct StreamListResponse {
    #[serde(default)]
    streams: Option<Vec<StreamInfo>>,
}

#[derive(Debug, Deserialize)]
struct ConsumerListResponse {
    #[serde(default)]
    consumers: Option<Vec<ConsumerInfo>>,
}

#[derive(Debug, Deserialize)]
struct MessageGetResponse {
    message: RawStoredMessage,
}

#[derive(Debug, Deserialize)]
struct RawStoredMessage {
    subject: String,
    seq: u64,
    #[serde(default)]
    data: String,
    time: chrono::DateTime<chrono::Utc>,
}

/// A message fetched directly out of a stream
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub subject: String,
    pub sequence: u64,
    pub payload: Bytes,
    pub time: chrono::DateTime<chrono::Utc>,
}

impl JetStream {
    /// Access the durable stream API under the default `$JS.API.`
    /// prefix
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self::with_prefix(client, DEFAULT_API_PREFIX)
    }

    /// Access the durable stream API of the given `domain`
    #[must_use]
    pub fn with_domain(client: Client, domain: impl Display) -> Self {
        Self::with_prefix(client, format!("$JS.{domain}.API"))
    }

    /// Access the durable stream API under a custom subject prefix
    #[must_use]
    pub fn with_prefix(client: Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the admin request timeout
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// The underlying core client
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn api_prefix(&self) -> &str {
        &self.prefix
    }

    pub(crate) fn default_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub(crate) async fn api_request<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        payload: Bytes,
    ) -> Result<T, JetStreamError> {
        let subject = format!("{}.{endpoint}", self.prefix)
            .try_into()
            .map_err(JetStreamError::Subject)?;

        let response = self
            .client
            .request_with(
                subject,
                payload,
                crate::request::RequestOptions::new().timeout(self.request_timeout),
            )
            .await
            .map_err(JetStreamError::Publish)?
            .await
            .map_err(JetStreamError::Request)?;

        match serde_json::from_slice::<ApiResponse<T>>(&response.message.payload)
            .map_err(JetStreamError::Json)?
        {
            ApiResponse::Ok(value) => Ok(value),
            ApiResponse::Error { error } => {
                debug!(endpoint, code = error.code, err_code = error.err_code, "api error");
                Err(JetStreamError::Api(error))
            }
        }
    }

    /// Publish into a stream and await the broker's acknowledgement.
    ///
    /// # Errors
    ///
    /// It returns an error if the publish fails, times out or the
    /// broker reports a storage error.
    pub async fn publish(
        &self,
        subject: pomelo_proto::Subject,
        payload: Bytes,
    ) -> Result<PublishAck, JetStreamError> {
        let response = self
            .client
            .request_with(
                subject,
                payload,
                crate::request::RequestOptions::new().timeout(self.request_timeout),
            )
            .await
            .map_err(JetStreamError::Publish)?
            .await
            .map_err(JetStreamError::Request)?;

        match serde_json::from_slice::<ApiResponse<PublishAck>>(&response.message.payload)
            .map_err(JetStreamError::Json)?
        {
            ApiResponse::Ok(ack) => Ok(ack),
            ApiResponse::Error { error } => Err(JetStreamError::Api(error)),
        }
    }

    /// Create a stream.
    ///
    /// # Errors
    ///
    /// It returns an error if a different stream with the same name
    /// already exists or the api rejects the configuration.
    pub async fn create_stream(&self, config: StreamConfig) -> Result<StreamInfo, JetStreamError> {
        let body = serde_json::to_vec(&config).map_err(JetStreamError::Json)?;
        self.api_request(&format!("STREAM.CREATE.{}", config.name), body.into())
            .await
    }

    /// Update a stream's configuration.
    ///
    /// # Errors
    ///
    /// It returns an error if the stream does not exist or the change
    /// is not allowed.
    pub async fn update_stream(&self, config: StreamConfig) -> Result<StreamInfo, JetStreamError> {
        let body = serde_json::to_vec(&config).map_err(JetStreamError::Json)?;
        self.api_request(&format!("STREAM.UPDATE.{}", config.name), body.into())
            .await
    }

    /// Fetch a stream's configuration and state.
    ///
    /// # Errors
    ///
    /// It returns an error if the stream does not exist
    /// ([`JetStreamError::is_not_found`]).
    pub async fn stream_info(&self, stream: impl Display) -> Result<StreamInfo, JetStreamError> {
        self.api_request(&format!("STREAM.INFO.{stream}"), Bytes::new())
            .await
    }

    /// List every stream visible to this context.
    ///
    /// # Errors
    ///
    /// It returns an error if the api request fails.
    pub async fn list_streams(&self) -> Result<Vec<StreamInfo>, JetStreamError> {
        let response: StreamListResponse = self
            .api_request("STREAM.LIST", json_body(&json!({ "offset": 0 }))?)
            .await?;
        Ok(response.streams.unwrap_or_default())
    }

    /// Delete a stream and every consumer attached to it.
    ///
    /// # Errors
    ///
    /// It returns an error if the stream does not exist.
    pub async fn delete_stream(&self, stream: impl Display) -> Result<bool, JetStreamError> {
        let response: SuccessResponse = self
            .api_request(&format!("STREAM.DELETE.{stream}"), Bytes::new())
            .await?;
        Ok(response.success)
    }

    /// Remove all (or a subject-filtered subset of) messages from a
    /// stream.
    ///
    /// # Errors
    ///
    /// It returns an error if the stream does not exist or purging is
    /// denied.
    pub async fn purge_stream(
        &self,
        stream: impl Display,
        filter: Option<pomelo_proto::Subject>,
    ) -> Result<u64, JetStreamError> {
        #[derive(Debug, Deserialize)]
        struct PurgeResponse {
            #[serde(default)]
            purged: u64,
        }

        let body = match filter {
            Some(filter) => json_body(&json!({ "filter": filter }))?,
            None => Bytes::new(),
        };
        let response: PurgeResponse = self
            .api_request(&format!("STREAM.PURGE.{stream}"), body)
            .await?;
        Ok(response.purged)
    }

    /// Fetch one stored message by stream sequence.
    ///
    /// # Errors
    ///
    /// It returns an error if the message or stream does not exist.
    pub async fn get_message(
        &self,
        stream: impl Display,
        sequence: u64,
    ) -> Result<StoredMessage, JetStreamError> {
        use data_encoding::BASE64;

        let response: MessageGetResponse = self
            .api_request(
                &format!("STREAM.MSG.GET.{stream}"),
                json_body(&json!({ "seq": sequence }))?,
            )
            .await?;

        let raw = response.message;
        let payload = BASE64
            .decode(raw.data.as_bytes())
            .map_err(JetStreamError::Payload)?
            .into();
        Ok(StoredMessage {
            subject: raw.subject,
            sequence: raw.seq,
            payload,
            time: raw.time,
        })
    }

    /// Erase one stored message by stream sequence.
    ///
    /// # Errors
    ///
    /// It returns an error if the message or stream does not exist.
    pub async fn delete_message(
        &self,
        stream: impl Display,
        sequence: u64,
    ) -> Result<bool, JetStreamError> {
        let response: SuccessResponse = self
            .api_request(
                &format!("STREAM.MSG.DELETE.{stream}"),
                json_body(&json!({ "seq": sequence }))?,
            )
            .await?;
        Ok(response.success)
    }

    /// Ask the stream's current raft leader to step down.
    ///
    /// # Errors
    ///
    /// It returns an error if the stream does not exist or is not
    /// clustered.
    pub async fn stream_leader_stepdown(
        &self,
        stream: impl Display,
    ) -> Result<bool, JetStreamError> {
        let response: SuccessResponse = self
            .api_request(&format!("STREAM.LEADER.STEPDOWN.{stream}"), Bytes::new())
            .await?;
        Ok(response.success)
    }

    /// Remove a peer from the stream's raft group.
    ///
    /// # Errors
    ///
    /// It returns an error if the stream or peer does not exist.
    pub async fn stream_peer_remove(
        &self,
        stream: impl Display,
        peer: impl Display,
    ) -> Result<bool, JetStreamError> {
        let response: SuccessResponse = self
            .api_request(
                &format!("STREAM.PEER.REMOVE.{stream}"),
                json_body(&json!({ "peer": peer.to_string() }))?,
            )
            .await?;
        Ok(response.success)
    }

    /// Create a consumer on `stream`.
    ///
    /// # Errors
    ///
    /// It returns an error if the stream does not exist or the
    /// configuration is rejected.
    pub async fn create_consumer(
        &self,
        stream: impl Display,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo, JetStreamError> {
        let name = if config.durable_name.is_empty() {
            config.name.clone()
        } else {
            config.durable_name.clone()
        };

        let endpoint = match (&*name, &config.filter_subject) {
            ("", _) => format!("CONSUMER.CREATE.{stream}"),
            (name, None) => format!("CONSUMER.CREATE.{stream}.{name}"),
            (name, Some(filter)) => format!("CONSUMER.CREATE.{stream}.{name}.{filter}"),
        };
        let body = json_body(&json!({
            "stream_name": stream.to_string(),
            "config": config,
        }))?;
        self.api_request(&endpoint, body).await
    }

    /// Fetch a consumer's configuration and state.
    ///
    /// # Errors
    ///
    /// It returns an error if the consumer does not exist
    /// ([`JetStreamError::is_not_found`]).
    pub async fn consumer_info(
        &self,
        stream: impl Display,
        consumer: impl Display,
    ) -> Result<ConsumerInfo, JetStreamError> {
        self.api_request(&format!("CONSUMER.INFO.{stream}.{consumer}"), Bytes::new())
            .await
    }

    /// List every consumer of `stream`.
    ///
    /// # Errors
    ///
    /// It returns an error if the stream does not exist.
    pub async fn list_consumers(
        &self,
        stream: impl Display,
    ) -> Result<Vec<ConsumerInfo>, JetStreamError> {
        let response: ConsumerListResponse = self
            .api_request(
                &format!("CONSUMER.LIST.{stream}"),
                json_body(&json!({ "offset": 0 }))?,
            )
            .await?;
        Ok(response.consumers.unwrap_or_default())
    }

    /// Delete a consumer.
    ///
    /// # Errors
    ///
    /// It returns an error if the consumer does not exist.
    pub async fn delete_consumer(
        &self,
        stream: impl Display,
        consumer: impl Display,
    ) -> Result<bool, JetStreamError> {
        let response: SuccessResponse = self
            .api_request(
                &format!("CONSUMER.DELETE.{stream}.{consumer}"),
                Bytes::new(),
            )
            .await?;
        Ok(response.success)
    }

    /// A handle to an existing pull consumer
    #[must_use]
    pub fn pull_consumer(
        &self,
        stream: impl Into<String>,
        consumer: impl Into<String>,
    ) -> PullConsumer {
        PullConsumer::new(self.clone(), stream.into(), consumer.into())
    }

    /// Create a pull consumer and return a handle to it.
    ///
    /// # Errors
    ///
    /// See [`JetStream::create_consumer`].
    pub async fn create_pull_consumer(
        &self,
        stream: impl Display,
        config: ConsumerConfig,
    ) -> Result<PullConsumer, JetStreamError> {
        let info = self.create_consumer(&stream, config).await?;
        Ok(PullConsumer::new(self.clone(), info.stream_name, info.name))
    }

    /// Consume a stream in order through an auto-managed ephemeral
    /// consumer
    ///
    /// The consumer is memory-backed, single-replica and
    /// acknowledgement-free; delivery gaps are repaired transparently
    /// by recreating it at the missing sequence.
    #[must_use]
    pub fn ordered_consumer(
        &self,
        stream: impl Into<String>,
        filter_subject: Option<pomelo_proto::Subject>,
    ) -> OrderedMessages {
        OrderedMessages::new(self.clone(), stream.into(), filter_subject)
    }
}

fn json_body(value: &serde_json::Value) -> Result<Bytes, JetStreamError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(JetStreamError::Json)
}
