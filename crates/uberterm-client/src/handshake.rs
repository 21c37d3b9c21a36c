//! Auth token retrieval, websocket dial and session negotiation.

use std::sync::LazyLock;
use std::time::Duration;

use tokio_tungstenite::Connector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use uberterm_protocol::InitMessage;

use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::{AuthTokenError, ClientOptions, Error, Result};

/// Pause after negotiation so the server registers the session before the
/// first resize frame arrives.
pub const NEGOTIATION_DELAY: Duration = Duration::from_millis(100);

static AUTH_TOKEN_PATTERN: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"var gotty_auth_token = '(.*)'").unwrap_or_else(|e| unreachable!("{e}"))
});

/// Pull the token out of the `auth_token.js` body.
#[must_use]
pub fn extract_auth_token(body: &str) -> Option<&str> {
    AUTH_TOKEN_PATTERN
        .captures(body)
        .and_then(|captures| captures.get(1))
        .map(|token| token.as_str())
}

/// HTTP client honouring the TLS and proxy toggles.
pub(crate) fn http_client(options: &ClientOptions) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if options.skip_tls_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if !options.use_proxy_from_env {
        builder = builder.no_proxy();
    }
    Ok(builder.build()?)
}

/// Attach credential headers to a control-plane request.
pub(crate) fn authorize(
    mut request: reqwest::RequestBuilder,
    options: &ClientOptions,
) -> Result<reqwest::RequestBuilder> {
    for (name, value) in options.credentials.headers()? {
        request = request.header(name, value);
    }
    Ok(request)
}

pub(crate) async fn fetch_auth_token(endpoint: &Endpoint, options: &ClientOptions) -> Result<String> {
    let url = endpoint.auth_token_url();
    tracing::debug!("fetching auth token from {url}");

    let client = http_client(options)?;
    let response = authorize(client.get(url), options)?.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(AuthTokenError::Status(status.as_u16()).into());
    }

    let body = response.text().await?;
    let token = extract_auth_token(&body).ok_or(AuthTokenError::Missing)?;
    Ok(token.to_string())
}

type Socket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

fn tls_connector(options: &ClientOptions) -> Result<Option<Connector>> {
    if !options.skip_tls_verify {
        return Ok(None);
    }
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()?;
    Ok(Some(Connector::NativeTls(connector)))
}

pub(crate) async fn dial(endpoint: &Endpoint, options: &ClientOptions) -> Result<Socket> {
    let url = endpoint.websocket_url()?;
    tracing::debug!("opening websocket {url}");

    let mut request = url.as_str().into_client_request()?;
    let headers = request.headers_mut();
    for (name, value) in options.credentials.headers()? {
        headers.append(name, value);
    }
    if let Some(origin) = options.ws_origin.as_deref().filter(|s| !s.is_empty()) {
        headers.insert(
            reqwest::header::ORIGIN,
            reqwest::header::HeaderValue::from_str(origin)?,
        );
    }

    let connector = tls_connector(options)?;
    let proxy = if options.use_proxy_from_env {
        crate::proxy::proxy_for(&url)
    } else {
        None
    };

    let (socket, _response) = match proxy {
        Some(proxy) => {
            let host = url
                .host_str()
                .ok_or_else(|| Error::Proxy(format!("websocket URL has no host: {url}")))?;
            let port = url.port_or_known_default().unwrap_or(80);
            let stream = crate::proxy::tunnel(&proxy, host, port).await?;
            tokio_tungstenite::client_async_tls_with_config(request, stream, None, connector)
                .await?
        }
        None => {
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
                .await?
        }
    };
    Ok(socket)
}

/// Send the untagged init message, then give the server a moment.
pub(crate) async fn negotiate(
    connection: &Connection,
    auth_token: &str,
    query: Option<&str>,
) -> Result<()> {
    let init = InitMessage::new(auth_token, query);
    tracing::debug!("negotiating session, arguments {:?}", init.arguments);
    connection.send_text(init.to_json()?).await?;
    tokio::time::sleep(NEGOTIATION_DELAY).await;
    Ok(())
}

/// The full handshake. Any failure aborts before a loop starts.
pub(crate) async fn connect(endpoint: &Endpoint, options: &ClientOptions) -> Result<Connection> {
    let auth_token = fetch_auth_token(endpoint, options).await?;
    let socket = dial(endpoint, options).await?;
    let connection = Connection::new(socket, options.revision, options.resize_format);
    negotiate(&connection, &auth_token, endpoint.query()).await?;
    tracing::debug!("connected using protocol {}", options.revision);
    Ok(connection)
}
