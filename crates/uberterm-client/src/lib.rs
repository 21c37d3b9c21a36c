//! Client library for gotty terminal sessions.
//!
//! A [`Client`] fetches an auth token from the control plane, opens the
//! websocket, negotiates the session and then pumps local terminal I/O over
//! the socket until the session is detached, closed or fails.

pub mod api;
mod connection;
mod endpoint;
mod escape;
mod handshake;
mod proxy;
mod pump;
mod shutdown;
pub mod terminal;

use std::sync::Arc;

pub use connection::{Connection, FrameSink, FrameStream};
pub use endpoint::{ADMIN_PASSWORD_HEADER, Credentials, Endpoint, normalize_url};
pub use escape::{EscapeDetector, Filtered};
pub use handshake::{NEGOTIATION_DELAY, extract_auth_token};
pub use pump::{INPUT_POLL_INTERVAL, PING_INTERVAL, RESIZE_START_DELAY};
pub use shutdown::{ExitReason, Shutdown};
pub use uberterm_protocol::{ResizeFormat, Revision, WindowSize};

use terminal::InputSource;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported URL scheme '{0}' (expected http or https)")]
    UnsupportedScheme(String),
    #[error("invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("proxy error: {0}")]
    Proxy(String),
    #[error(transparent)]
    AuthToken(#[from] AuthTokenError),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("server error: {0}")]
    Server(String),
    #[error("no instance with callsign '{0}' found")]
    InstanceNotFound(String),
    #[error("received empty frame")]
    EmptyFrame,
    #[error("websocket read half is already in use")]
    StreamInUse,
    #[error("pump loop failed: {0}")]
    LoopFailed(String),
}

/// Failure to obtain the auth token that opens a session.
#[derive(Debug, thiserror::Error)]
pub enum AuthTokenError {
    #[error("failed to fetch auth token (HTTP {0})")]
    Status(u16),
    #[error("auth token not found in response; the server may be incompatible or outdated")]
    Missing,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Caller-supplied connection toggles. Nothing here is inferred.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub credentials: Credentials,
    /// Value of the websocket `Origin` header.
    pub ws_origin: Option<String>,
    pub skip_tls_verify: bool,
    /// Honour `HTTP(S)_PROXY`/`NO_PROXY` for both HTTP and websocket traffic.
    pub use_proxy_from_env: bool,
    pub revision: Revision,
    pub resize_format: ResizeFormat,
    /// Local detach sequence; empty disables detaching.
    pub detach_keys: Vec<u8>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            ws_origin: None,
            skip_tls_verify: false,
            use_proxy_from_env: false,
            revision: Revision::default(),
            resize_format: ResizeFormat::default(),
            detach_keys: vec![0x10, 0x11],
        }
    }
}

type Output = Arc<parking_lot::Mutex<Box<dyn std::io::Write + Send>>>;
type Input = Arc<parking_lot::Mutex<Box<dyn InputSource>>>;
type WindowSizeFn = Arc<dyn Fn() -> std::io::Result<WindowSize> + Send + Sync>;

/// One terminal session against one gotty endpoint.
pub struct Client {
    endpoint: Endpoint,
    options: ClientOptions,
    output: Output,
    input: Option<Input>,
    window_size: WindowSizeFn,
    shutdown: Shutdown,
    connection: Option<Arc<Connection>>,
}

impl Client {
    /// Credentials embedded in the endpoint URL fill in a missing user.
    #[must_use]
    pub fn new(endpoint: Endpoint, mut options: ClientOptions) -> Self {
        options.credentials.fill_from(endpoint.userinfo());
        Self {
            endpoint,
            options,
            output: Arc::new(parking_lot::Mutex::new(Box::new(std::io::stdout()))),
            input: None,
            window_size: Arc::new(terminal::window_size),
            shutdown: Shutdown::new(),
            connection: None,
        }
    }

    pub fn from_url(url: &str, options: ClientOptions) -> Result<Self> {
        Ok(Self::new(Endpoint::parse(url)?, options))
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Redirect decoded terminal output (stdout by default).
    pub fn set_output(&mut self, output: impl std::io::Write + Send + 'static) {
        self.output = Arc::new(parking_lot::Mutex::new(Box::new(output)));
    }

    /// Replace the local input source (stdin by default).
    pub fn set_input(&mut self, input: impl InputSource + 'static) {
        self.input = Some(Arc::new(parking_lot::Mutex::new(Box::new(input))));
    }

    /// Replace the window size query (the controlling terminal by default).
    pub fn set_window_size(
        &mut self,
        query: impl Fn() -> std::io::Result<WindowSize> + Send + Sync + 'static,
    ) {
        self.window_size = Arc::new(query);
    }

    /// Handle that forces the running session to shut down from outside.
    #[must_use]
    pub fn exit_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Force shutdown. Returns false if the session was already ending.
    pub fn exit_loop(&self) -> bool {
        self.shutdown.trigger("external", ExitReason::Requested)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Use an already negotiated connection instead of performing the
    /// handshake.
    pub fn set_connection(&mut self, connection: Connection) {
        self.connection = Some(Arc::new(connection));
    }

    /// Fetch the auth token, open the websocket and negotiate the session.
    pub async fn connect(&mut self) -> Result<()> {
        let connection = handshake::connect(&self.endpoint, &self.options).await?;
        self.connection = Some(Arc::new(connection));
        Ok(())
    }

    /// Connect if needed, then pump terminal I/O until shutdown.
    ///
    /// Returns why an orderly session ended, or the first transport error.
    pub async fn run(&mut self) -> Result<ExitReason> {
        if self.connection.is_none() {
            self.connect().await?;
        }
        let Some(connection) = self.connection.clone() else {
            return Err(Error::LoopFailed("connection missing after handshake".to_string()));
        };

        let input = match &self.input {
            Some(input) => input.clone(),
            None => {
                let input: Input = Arc::new(parking_lot::Mutex::new(Box::new(
                    terminal::FdInput::stdin()?,
                )));
                self.input = Some(input.clone());
                input
            }
        };

        let session = pump::Session {
            connection,
            shutdown: self.shutdown.clone(),
            output: self.output.clone(),
            input,
            window_size: self.window_size.clone(),
            detach_keys: self.options.detach_keys.clone(),
        };
        pump::run(session).await
    }

    /// Close the websocket. A no-op if never connected.
    pub async fn close(&mut self) -> Result<()> {
        match self.connection.take() {
            Some(connection) => connection.close().await,
            None => Ok(()),
        }
    }
}
