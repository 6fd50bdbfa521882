//! An auto-reconnecting pub/sub messaging client.
//!
//! The [`core::Client`] owns a supervised connection to a broker
//! cluster: publishes, request/reply and subscriptions survive
//! reconnects transparently. The [`jetstream`] module layers the
//! durable-stream admin API and a credit-managed pull consumer on top
//! of it.

pub use pomelo_proto as proto;

mod client;
mod config;
mod error;
mod events;
mod handler;
mod pool;
mod request;
mod subscription;
#[cfg(test)]
pub(crate) mod testing;

pub mod core {
    //! Core connection, publish/subscribe and request/reply support

    pub use crate::client::Client;
    pub use crate::config::ClientBuilder;
    pub use crate::events::{ClientEvent, ConnectionState};
    pub use crate::request::{RequestOptions, ResponseFut};
    pub use crate::subscription::Subscriber;
    pub use pomelo_net::AuthMethod;

    pub mod error {
        //! Core connection errors

        pub use crate::client::ConnectError;
        pub use crate::error::{
            ClientClosedError, PublishError, RequestError, SubscribeError, TryCommandError,
            UsageError,
        };
    }
}

pub mod jetstream;
