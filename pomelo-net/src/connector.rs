use std::io;

use pomelo_proto::{
    decode::DecodeError, error::ServerError, ClientFrame, Connect, ServerAddr, ServerFrame,
    ServerInfo, TlsMode,
};
use tokio::net::TcpStream;
use tokio_rustls::{rustls::pki_types::InvalidDnsNameError, TlsConnector};
use tracing::debug;

use crate::{
    auth::{AuthError, AuthMethod},
    dial::dial,
    framed::{FramedConnection, ReadFrameError},
    tls::{server_name, MaybeTls},
};

/// Options for [`establish`]
pub struct ConnectOptions<'a> {
    pub client_name: Option<String>,
    pub echo: bool,
    pub tls_mode: TlsMode,
    pub tls_connector: &'a TlsConnector,
    pub auth: Option<&'a AuthMethod>,
}

impl std::fmt::Debug for ConnectOptions<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("client_name", &self.client_name)
            .field("echo", &self.echo)
            .field("tls_mode", &self.tls_mode)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

/// An error encountered while establishing a connection
#[derive(Debug, thiserror::Error)]
pub enum EstablishError {
    #[error("io error")]
    Io(#[source] io::Error),
    #[error("tls negotiation failed")]
    Tls(#[source] io::Error),
    #[error("host is not a valid TLS server name")]
    InvalidDnsName(#[source] InvalidDnsNameError),
    #[error("the broker does not support TLS")]
    TlsUnavailable,
    #[error("TLS is disabled but the broker requires it")]
    TlsRequiredByServer,
    #[error("malformed broker output")]
    Protocol(#[source] DecodeError),
    #[error("unexpected frame during handshake")]
    UnexpectedFrame,
    #[error("could not prepare authentication")]
    Auth(#[source] AuthError),
    #[error("the broker rejected our credentials")]
    AuthRejected(#[source] ServerError),
    #[error("the broker rejected the handshake")]
    Rejected(#[source] ServerError),
}

/// Establish a connection to `addr`: dial, negotiate TLS according to
/// the policy, authenticate and complete the `CONNECT`/`PING` →
/// `PONG` barrier.
///
/// `on_socket_open` runs once the TCP socket is connected, before the
/// handshake starts.
///
/// # Errors
///
/// It returns an error if any handshake step fails; see
/// [`EstablishError`].
pub async fn establish(
    addr: &ServerAddr,
    options: ConnectOptions<'_>,
    on_socket_open: impl FnOnce(),
) -> Result<(FramedConnection<MaybeTls<TcpStream>>, Box<ServerInfo>), EstablishError> {
    let tls_mode = effective_tls_mode(addr, options.tls_mode);

    let socket = dial(addr).await.map_err(EstablishError::Io)?;
    socket.set_nodelay(true).map_err(EstablishError::Io)?;
    on_socket_open();
    let mut io = MaybeTls::Plain(socket);

    if matches!(tls_mode, TlsMode::Implicit) {
        io = upgrade(io, options.tls_connector, addr).await?;
    }

    let mut conn = FramedConnection::new(io);

    let info = match conn.read_frame().await {
        Ok(ServerFrame::Info { info }) => info,
        Ok(_) => return Err(EstablishError::UnexpectedFrame),
        Err(err) => return Err(err.into()),
    };
    debug!(
        server_id = %info.server_id,
        version = %info.version,
        tls_required = info.tls_required,
        "received INFO"
    );

    let advertises_tls = info.tls_available || info.tls_required;
    let should_upgrade = match tls_mode {
        TlsMode::Implicit => false,
        TlsMode::Disabled => {
            if info.tls_required {
                return Err(EstablishError::TlsRequiredByServer);
            }
            false
        }
        TlsMode::Prefer => advertises_tls,
        TlsMode::Require => {
            if !advertises_tls {
                return Err(EstablishError::TlsUnavailable);
            }
            true
        }
    };
    if should_upgrade {
        // The decoder is empty here: the broker says nothing else
        // until it has seen our CONNECT
        let io = conn.into_inner();
        let io = upgrade(io, options.tls_connector, addr).await?;
        conn = FramedConnection::new(io);
    }

    let mut connect = Connect::new(options.client_name);
    connect.echo = options.echo;
    connect.tls_required = matches!(tls_mode, TlsMode::Require | TlsMode::Implicit);

    let from_addr;
    let auth = match options.auth {
        Some(auth) => Some(auth),
        None => match AuthMethod::from_addr(addr) {
            Some(auth) => {
                from_addr = auth;
                Some(&from_addr)
            }
            None => None,
        },
    };
    if let Some(auth) = auth {
        auth.apply(&info, &mut connect)
            .map_err(EstablishError::Auth)?;
    }

    conn.enqueue(&ClientFrame::Connect {
        connect: Box::new(connect),
    });
    conn.enqueue(&ClientFrame::Ping);
    conn.write_and_flush().await.map_err(EstablishError::Io)?;

    loop {
        match conn.read_frame().await {
            Ok(ServerFrame::Ok) => {
                // CONNECT acknowledged, the PONG is next
            }
            Ok(ServerFrame::Pong) => break,
            Ok(ServerFrame::Ping) => {
                conn.enqueue(&ClientFrame::Pong);
                conn.write_and_flush().await.map_err(EstablishError::Io)?;
            }
            Ok(ServerFrame::Error { error }) if error.is_auth() => {
                return Err(EstablishError::AuthRejected(error));
            }
            Ok(ServerFrame::Error { error }) => return Err(EstablishError::Rejected(error)),
            Ok(ServerFrame::Info { .. } | ServerFrame::Delivery { .. }) => {
                return Err(EstablishError::UnexpectedFrame);
            }
            Err(err) => return Err(err.into()),
        }
    }

    debug!(server_id = %info.server_id, "handshake complete");
    Ok((conn, info))
}

fn effective_tls_mode(addr: &ServerAddr, configured: TlsMode) -> TlsMode {
    match (addr.tls_mode(), configured) {
        // An explicit `tls://` scheme must not weaken an implicit-TLS config
        (Some(TlsMode::Require), TlsMode::Implicit) => TlsMode::Implicit,
        (Some(from_scheme), _) => from_scheme,
        (None, configured) => configured,
    }
}

async fn upgrade(
    io: MaybeTls<TcpStream>,
    connector: &TlsConnector,
    addr: &ServerAddr,
) -> Result<MaybeTls<TcpStream>, EstablishError> {
    let domain = server_name(addr).map_err(EstablishError::InvalidDnsName)?;
    io.upgrade(connector, domain)
        .await
        .map_err(EstablishError::Tls)
}

impl From<ReadFrameError> for EstablishError {
    fn from(err: ReadFrameError) -> Self {
        match err {
            ReadFrameError::Decode(err) => Self::Protocol(err),
            ReadFrameError::Io(err) => Self::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use pomelo_proto::{ServerAddr, TlsMode};

    use super::effective_tls_mode;

    #[test]
    fn scheme_overrides_weaker_configs() {
        let tls_addr = "tls://example.com".parse::<ServerAddr>().unwrap();
        let plain_addr = "nats://example.com".parse::<ServerAddr>().unwrap();

        assert_eq!(
            TlsMode::Require,
            effective_tls_mode(&tls_addr, TlsMode::Disabled)
        );
        assert_eq!(
            TlsMode::Require,
            effective_tls_mode(&tls_addr, TlsMode::Prefer)
        );
        assert_eq!(
            TlsMode::Implicit,
            effective_tls_mode(&tls_addr, TlsMode::Implicit)
        );
        assert_eq!(
            TlsMode::Prefer,
            effective_tls_mode(&plain_addr, TlsMode::Prefer)
        );
        assert_eq!(
            TlsMode::Disabled,
            effective_tls_mode(&plain_addr, TlsMode::Disabled)
        );
    }
}
