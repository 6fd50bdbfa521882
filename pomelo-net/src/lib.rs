pub use self::auth::AuthMethod;
pub use self::connector::{establish, ConnectOptions};
pub use self::dial::dial;
pub use self::framed::FramedConnection;
pub use self::tls::{default_tls_connector, insecure_tls_connector, MaybeTls};
pub use tokio_rustls::TlsConnector;

mod auth;
mod connector;
mod dial;
mod framed;
mod tls;

pub mod error {
    pub use super::auth::{AuthError, CredentialsParseError};
    pub use super::connector::EstablishError;
    pub use super::framed::ReadFrameError;
}
