use std::num::NonZeroU64;

use crate::{
    connect::Connect, message::Delivery, message::Message, queue_group::QueueGroup,
    server_error::ServerError, sid::Sid, subject::Subject, ServerInfo,
};

/// A frame sent by the client
#[derive(Debug)]
pub enum ClientFrame {
    Connect {
        connect: Box<Connect>,
    },
    Publish {
        message: Message,
    },
    Subscribe {
        sid: Sid,
        subject: Subject,
        queue_group: Option<QueueGroup>,
    },
    Unsubscribe {
        sid: Sid,
        max_messages: Option<NonZeroU64>,
    },
    Ping,
    Pong,
}

/// A frame received from the broker
#[derive(Debug, PartialEq, Eq)]
pub enum ServerFrame {
    Info { info: Box<ServerInfo> },
    Delivery { delivery: Delivery },
    Ok,
    Error { error: ServerError },
    Ping,
    Pong,
}
