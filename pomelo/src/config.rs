use std::{path::PathBuf, time::Duration};

use pomelo_net::{default_tls_connector, error::CredentialsParseError, AuthMethod, TlsConnector};
use pomelo_nkeys::{SeedDecodeError, SeedKey};
use pomelo_proto::{error::ServerAddrError, ServerAddr, Subject, TlsMode};

use crate::client::{Client, ConnectError};

/// A builder for [`Client`]
///
/// Obtained from [`Client::builder`].
pub struct ClientBuilder {
    pub(crate) servers: Vec<ServerAddr>,
    pub(crate) client_name: Option<String>,
    pub(crate) echo: bool,

    pub(crate) ping_interval: Duration,
    pub(crate) ping_timeout: Duration,
    pub(crate) reconnect_delay_min: Duration,
    pub(crate) reconnect_delay_max: Duration,
    pub(crate) reconnect_jitter: Duration,
    pub(crate) max_reconnects: Option<u32>,

    pub(crate) command_buffer_size: usize,
    pub(crate) object_pool_size: usize,
    pub(crate) subscription_cleanup_interval: Duration,
    pub(crate) flush_interval: Duration,
    pub(crate) inbox_prefix: Subject,
    pub(crate) request_timeout: Duration,

    pub(crate) tls_mode: TlsMode,
    pub(crate) tls_ca_file: Option<PathBuf>,
    pub(crate) tls_cert_file: Option<PathBuf>,
    pub(crate) tls_key_file: Option<PathBuf>,
    pub(crate) tls_insecure_skip_verify: bool,
    pub(crate) tls_connector: Option<TlsConnector>,

    pub(crate) auth: Option<AuthMethod>,
}

impl ClientBuilder {
    pub(crate) fn new() -> Self {
        Self {
            servers: Vec::new(),
            client_name: None,
            echo: true,

            ping_interval: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(5),
            reconnect_delay_min: Duration::from_millis(100),
            reconnect_delay_max: Duration::from_secs(10),
            reconnect_jitter: Duration::from_millis(100),
            max_reconnects: None,

            command_buffer_size: 512,
            object_pool_size: 256,
            subscription_cleanup_interval: Duration::from_secs(30),
            flush_interval: Duration::ZERO,
            inbox_prefix: Subject::from_static("_INBOX"),
            request_timeout: Duration::from_secs(5),

            tls_mode: TlsMode::Prefer,
            tls_ca_file: None,
            tls_cert_file: None,
            tls_key_file: None,
            tls_insecure_skip_verify: false,
            tls_connector: None,

            auth: None,
        }
    }

    /// Add a broker address to the seed list
    ///
    /// The seed list is rotated on connect and reconnect; addresses
    /// discovered through `INFO.connect_urls` are appended to it at
    /// runtime.
    ///
    /// # Errors
    ///
    /// It returns an error if `url` is not a valid broker address.
    pub fn server(mut self, url: &str) -> Result<Self, ServerAddrError> {
        self.servers.push(url.parse()?);
        Ok(self)
    }

    /// Add an already-parsed broker address to the seed list
    #[must_use]
    pub fn server_addr(mut self, addr: ServerAddr) -> Self {
        self.servers.push(addr);
        self
    }

    /// The client name advertised in `CONNECT`
    #[must_use]
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// Stop the broker from echoing this client's publishes back to
    /// its own subscriptions
    #[must_use]
    pub fn no_echo(mut self) -> Self {
        self.echo = false;
        self
    }

    /// Interval between client-initiated `PING`s
    ///
    /// Two consecutive unanswered pings trigger a reconnect.
    ///
    /// Default: 10 seconds
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Upper bound on the duration of the connection handshake
    ///
    /// Default: 5 seconds
    #[must_use]
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Bounds for the randomized exponential reconnect backoff
    ///
    /// Default: 100 milliseconds to 10 seconds
    #[must_use]
    pub fn reconnect_delay(mut self, min: Duration, max: Duration) -> Self {
        self.reconnect_delay_min = min;
        self.reconnect_delay_max = max.max(min);
        self
    }

    /// Random jitter added on top of each reconnect delay
    ///
    /// Default: 100 milliseconds
    #[must_use]
    pub fn reconnect_jitter(mut self, jitter: Duration) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    /// Number of consecutive failed reconnect attempts after which the
    /// client gives up and closes; `None` retries forever
    ///
    /// Default: `None`
    #[must_use]
    pub fn max_reconnects(mut self, max_reconnects: Option<u32>) -> Self {
        self.max_reconnects = max_reconnects;
        self
    }

    /// Capacity of the command channel between the public API and the
    /// connection task
    ///
    /// Publishes suspend while the channel is full.
    ///
    /// Default: 512
    #[must_use]
    pub fn command_buffer_size(mut self, size: usize) -> Self {
        self.command_buffer_size = size.max(1);
        self
    }

    /// Capacity of each subscription's delivery buffer
    ///
    /// Default: 256
    #[must_use]
    pub fn object_pool_size(mut self, size: usize) -> Self {
        self.object_pool_size = size.max(1);
        self
    }

    /// Interval of the sweep that unsubscribes subscriptions whose
    /// consumer disappeared without closing them
    ///
    /// Default: 30 seconds
    #[must_use]
    pub fn subscription_cleanup_interval(mut self, interval: Duration) -> Self {
        self.subscription_cleanup_interval = interval.max(Duration::from_millis(10));
        self
    }

    /// Delay write flushes to batch small frames into larger packets
    ///
    /// [`Duration::ZERO`] flushes as fast as the socket allows.
    ///
    /// Default: 0
    #[must_use]
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Prefix of the subject namespace used for reply correlation
    ///
    /// Default: `_INBOX`
    #[must_use]
    pub fn inbox_prefix(mut self, prefix: Subject) -> Self {
        self.inbox_prefix = prefix;
        self
    }

    /// Default timeout for request/reply calls
    ///
    /// Default: 5 seconds
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// When to upgrade connections to TLS
    ///
    /// A `tls://` seed address forces [`TlsMode::Require`] for that
    /// server regardless of this setting.
    ///
    /// Default: [`TlsMode::Prefer`]
    #[must_use]
    pub fn tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls_mode = mode;
        self
    }

    /// Path of a CA bundle for the external certificate loader
    ///
    /// The client does not read certificate files itself; the path is
    /// carried for the embedding application, which typically loads it
    /// and installs the result through [`ClientBuilder::tls_connector`].
    #[must_use]
    pub fn tls_ca_file(mut self, path: PathBuf) -> Self {
        self.tls_ca_file = Some(path);
        self
    }

    /// Path of the client certificate for the external loader
    #[must_use]
    pub fn tls_cert_file(mut self, path: PathBuf) -> Self {
        self.tls_cert_file = Some(path);
        self
    }

    /// Path of the client key for the external loader
    #[must_use]
    pub fn tls_key_file(mut self, path: PathBuf) -> Self {
        self.tls_key_file = Some(path);
        self
    }

    /// Skip verification of the broker's certificate chain
    ///
    /// Default: `false`
    #[must_use]
    pub fn tls_insecure_skip_verify(mut self, skip: bool) -> Self {
        self.tls_insecure_skip_verify = skip;
        self
    }

    /// Install a pre-built TLS connector, overriding the default
    /// platform-verifier configuration
    #[must_use]
    pub fn tls_connector(mut self, connector: TlsConnector) -> Self {
        self.tls_connector = Some(connector);
        self
    }

    /// Define an authentication method
    #[must_use]
    pub fn authentication_method(mut self, auth: Option<AuthMethod>) -> Self {
        self.auth = auth;
        self
    }

    /// Authenticate with a bare token
    #[must_use]
    pub fn auth_token(self, token: impl Into<String>) -> Self {
        self.authentication_method(Some(AuthMethod::Token(token.into())))
    }

    /// Authenticate with a username and password
    #[must_use]
    pub fn auth_user_password(
        self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.authentication_method(Some(AuthMethod::UserPassword {
            username: username.into(),
            password: password.into(),
        }))
    }

    /// Authenticate by signing the broker nonce with an nkey seed.
    ///
    /// # Errors
    ///
    /// It returns an error if `seed` is not a valid nkey seed.
    pub fn auth_nkey_seed(self, seed: &str) -> Result<Self, SeedDecodeError> {
        let seed = SeedKey::from_encoded_seed(seed)?;
        Ok(self.authentication_method(Some(AuthMethod::Nkey(seed))))
    }

    /// Authenticate with the contents of a `.creds` file.
    ///
    /// # Errors
    ///
    /// It returns an error if `contents` is not a valid credentials
    /// document.
    pub fn auth_credentials(self, contents: &str) -> Result<Self, CredentialsParseError> {
        let auth = AuthMethod::from_credentials(contents)?;
        Ok(self.authentication_method(Some(auth)))
    }

    pub(crate) fn build_tls_connector(&self) -> TlsConnector {
        if let Some(connector) = &self.tls_connector {
            connector.clone()
        } else if self.tls_insecure_skip_verify {
            pomelo_net::insecure_tls_connector()
        } else {
            default_tls_connector()
        }
    }

    /// Connect to the first reachable seed server and return the
    /// client.
    ///
    /// # Errors
    ///
    /// It returns an error if no seed server is configured or none of
    /// them accepts the connection.
    pub async fn connect(self) -> Result<Client, ConnectError> {
        Client::connect_with(self).await
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("servers", &self.servers)
            .field("client_name", &self.client_name)
            .field("echo", &self.echo)
            .field("ping_interval", &self.ping_interval)
            .field("ping_timeout", &self.ping_timeout)
            .field("reconnect_delay_min", &self.reconnect_delay_min)
            .field("reconnect_delay_max", &self.reconnect_delay_max)
            .field("reconnect_jitter", &self.reconnect_jitter)
            .field("max_reconnects", &self.max_reconnects)
            .field("command_buffer_size", &self.command_buffer_size)
            .field("object_pool_size", &self.object_pool_size)
            .field(
                "subscription_cleanup_interval",
                &self.subscription_cleanup_interval,
            )
            .field("flush_interval", &self.flush_interval)
            .field("inbox_prefix", &self.inbox_prefix)
            .field("request_timeout", &self.request_timeout)
            .field("tls_mode", &self.tls_mode)
            .field("tls_insecure_skip_verify", &self.tls_insecure_skip_verify)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}
