//! HTTP CONNECT tunnelling through the proxy named in the environment.

use base64::Engine as _;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use url::Url;

use crate::{Error, Result};

const MAX_RESPONSE_HEAD: usize = 8192;

fn env_var(names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| std::env::var(name).ok())
        .filter(|value| !value.trim().is_empty())
}

/// Whether `host` is excluded by a NO_PROXY style list.
fn bypassed(no_proxy: &str, host: &str) -> bool {
    no_proxy
        .split(',')
        .map(|entry| entry.trim().trim_start_matches('.'))
        .filter(|entry| !entry.is_empty())
        .any(|entry| {
            entry == "*"
                || host == entry
                || host
                    .strip_suffix(entry)
                    .is_some_and(|rest| rest.ends_with('.'))
        })
}

/// The proxy the environment configures for a websocket URL, if any.
pub(crate) fn proxy_for(target: &Url) -> Option<Url> {
    let host = target.host_str()?;
    if let Some(no_proxy) = env_var(&["NO_PROXY", "no_proxy"]) {
        if bypassed(&no_proxy, host) {
            return None;
        }
    }

    let raw = match target.scheme() {
        "wss" | "https" => env_var(&["HTTPS_PROXY", "https_proxy"]),
        _ => env_var(&["HTTP_PROXY", "http_proxy"]),
    }
    .or_else(|| env_var(&["ALL_PROXY", "all_proxy"]))?;

    let parsed = if raw.contains("://") {
        Url::parse(&raw)
    } else {
        Url::parse(&format!("http://{raw}"))
    };
    match parsed {
        Ok(url) => Some(url),
        Err(e) => {
            tracing::warn!("ignoring invalid proxy URL {raw:?}: {e}");
            None
        }
    }
}

/// Open a TCP tunnel to `host:port` through an HTTP proxy.
pub(crate) async fn tunnel(proxy: &Url, host: &str, port: u16) -> Result<tokio::net::TcpStream> {
    if proxy.scheme() != "http" {
        return Err(Error::Proxy(format!(
            "unsupported proxy scheme '{}'",
            proxy.scheme()
        )));
    }
    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| Error::Proxy(format!("proxy URL has no host: {proxy}")))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(80);

    tracing::debug!("tunnelling to {host}:{port} through proxy {proxy_host}:{proxy_port}");
    let mut stream = tokio::net::TcpStream::connect((proxy_host, proxy_port)).await?;

    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if !proxy.username().is_empty() {
        let user = urlencoding::decode(proxy.username())
            .map_or_else(|_| proxy.username().to_string(), |s| s.into_owned());
        let password = proxy
            .password()
            .map(|p| urlencoding::decode(p).map_or_else(|_| p.to_string(), |s| s.into_owned()))
            .unwrap_or_default();
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
        request.push_str(&format!("Proxy-Authorization: Basic {encoded}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Read the response head one byte at a time so nothing past it is consumed.
    let mut head = Vec::with_capacity(256);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(Error::Proxy("proxy response header too large".to_string()));
        }
        let byte = stream.read_u8().await?;
        head.push(byte);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if status != "200" {
        return Err(Error::Proxy(format!("CONNECT refused: {status_line}")));
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_proxy_matching() {
        assert!(bypassed("localhost,.internal", "localhost"));
        assert!(bypassed("localhost,.internal", "db.internal"));
        assert!(!bypassed("localhost,.internal", "internal.example.com"));
        assert!(!bypassed("example.com", "badexample.com"));
        assert!(bypassed("*", "anything"));
        assert!(!bypassed("", "anything"));
    }

    #[tokio::test]
    async fn test_tunnel_handshake() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let mut received = Vec::new();
            while !received.ends_with(b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8(received).unwrap()
        });

        let proxy = Url::parse(&format!("http://user:pw@{addr}")).unwrap();
        tunnel(&proxy, "gotty.example.com", 443).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("CONNECT gotty.example.com:443 HTTP/1.1\r\n"));
        // base64("user:pw")
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwdw==\r\n"));
    }

    #[tokio::test]
    async fn test_tunnel_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let proxy = Url::parse(&format!("http://{addr}")).unwrap();
        let err = tunnel(&proxy, "host", 80).await.unwrap_err();
        assert!(matches!(err, Error::Proxy(msg) if msg.contains("407")));
    }
}
