pub use self::address::{Host, ServerAddr, TlsMode};
pub use self::connect::Connect;
pub use self::frame::{ClientFrame, ServerFrame};
pub use self::headers::{HeaderMap, HeaderName, HeaderValue};
pub use self::info::ServerInfo;
pub use self::message::{Delivery, Message};
pub use self::queue_group::QueueGroup;
pub use self::sid::Sid;
pub use self::status::StatusCode;
pub use self::subject::Subject;

mod address;
mod connect;
pub mod decode;
pub mod encode;
mod frame;
mod headers;
mod info;
mod message;
mod queue_group;
mod server_error;
mod sid;
mod status;
mod subject;
mod util;

pub mod error {
    pub use super::address::ServerAddrError;
    pub use super::decode::DecodeError;
    pub use super::headers::{HeaderNameError, HeaderValueError};
    pub use super::queue_group::QueueGroupError;
    pub use super::server_error::ServerError;
    pub use super::status::StatusCodeError;
    pub use super::subject::SubjectError;
    pub use super::util::ParseUintError;
}
