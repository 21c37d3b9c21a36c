//! Wire protocol for gotty terminal sessions.
//!
//! Every frame except the initial negotiation message is a single tag byte
//! followed by a payload. The tag values depend on the [`Revision`] chosen
//! before the connection is opened.

pub mod api;

use base64::Engine as _;
use bytes::{Buf as _, BufMut as _};

/// End-of-transmission control byte, sent as input when local input closes.
pub const EOT: u8 = 0x04;

/// Protocol revision, fixing the tag table for the lifetime of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Revision {
    /// gotty 1.x.
    V1,
    /// gotty 2.0.
    #[default]
    V2,
}

/// One-byte tags for every message kind in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagTable {
    pub output: u8,
    pub pong: u8,
    pub set_window_title: u8,
    pub set_preferences: u8,
    pub set_reconnect: u8,
    pub input: u8,
    pub ping: u8,
    pub resize_terminal: u8,
}

const V1_TAGS: TagTable = TagTable {
    output: b'0',
    pong: b'1',
    set_window_title: b'2',
    set_preferences: b'3',
    set_reconnect: b'4',
    input: b'0',
    ping: b'1',
    resize_terminal: b'2',
};

// '0' is reserved as "unknown" in both directions.
const V2_TAGS: TagTable = TagTable {
    output: b'1',
    pong: b'2',
    set_window_title: b'3',
    set_preferences: b'4',
    set_reconnect: b'5',
    input: b'1',
    ping: b'2',
    resize_terminal: b'3',
};

/// Server to client message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    Output,
    Pong,
    SetWindowTitle,
    SetPreferences,
    SetReconnect,
}

impl ServerKind {
    pub const ALL: [Self; 5] = [
        Self::Output,
        Self::Pong,
        Self::SetWindowTitle,
        Self::SetPreferences,
        Self::SetReconnect,
    ];
}

/// Client to server message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Input,
    Ping,
    ResizeTerminal,
}

impl ClientKind {
    pub const ALL: [Self; 3] = [Self::Input, Self::Ping, Self::ResizeTerminal];
}

impl Revision {
    #[must_use]
    pub const fn tags(self) -> &'static TagTable {
        match self {
            Self::V1 => &V1_TAGS,
            Self::V2 => &V2_TAGS,
        }
    }

    #[must_use]
    pub const fn server_tag(self, kind: ServerKind) -> u8 {
        let tags = self.tags();
        match kind {
            ServerKind::Output => tags.output,
            ServerKind::Pong => tags.pong,
            ServerKind::SetWindowTitle => tags.set_window_title,
            ServerKind::SetPreferences => tags.set_preferences,
            ServerKind::SetReconnect => tags.set_reconnect,
        }
    }

    #[must_use]
    pub fn server_kind(self, tag: u8) -> Option<ServerKind> {
        ServerKind::ALL
            .into_iter()
            .find(|&kind| self.server_tag(kind) == tag)
    }

    #[must_use]
    pub const fn client_tag(self, kind: ClientKind) -> u8 {
        let tags = self.tags();
        match kind {
            ClientKind::Input => tags.input,
            ClientKind::Ping => tags.ping,
            ClientKind::ResizeTerminal => tags.resize_terminal,
        }
    }

    #[must_use]
    pub fn client_kind(self, tag: u8) -> Option<ClientKind> {
        ClientKind::ALL
            .into_iter()
            .find(|&kind| self.client_tag(kind) == tag)
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V1 => f.write_str("v1"),
            Self::V2 => f.write_str("v2"),
        }
    }
}

impl std::str::FromStr for Revision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "v1" | "1" => Ok(Self::V1),
            "v2" | "2" => Ok(Self::V2),
            other => Err(format!("unknown protocol revision: {other}")),
        }
    }
}

/// Errors decoding a tagged frame. None of these are fatal to a connection
/// except [`DecodeError::Empty`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("unhandled protocol message: {}", String::from_utf8_lossy(.0))]
    UnknownTag(Vec<u8>),
    #[error("invalid base64 content: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid reconnect hint {payload:?}: {source}")]
    Reconnect {
        payload: String,
        source: serde_json::Error,
    },
    #[error("invalid window size payload ({0} bytes)")]
    WindowSize(usize),
    #[error("invalid window size JSON: {0}")]
    WindowSizeJson(#[from] serde_json::Error),
}

/// Terminal dimensions carried by a resize frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WindowSize {
    pub rows: u16,
    #[serde(rename = "columns")]
    pub cols: u16,
}

impl WindowSize {
    #[must_use]
    pub const fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

/// How the resize payload is laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeFormat {
    /// Two big-endian u16 fields: rows, then columns.
    #[default]
    Binary,
    /// `{"rows":24,"columns":80}`.
    Json,
}

impl std::str::FromStr for ResizeFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binary" => Ok(Self::Binary),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown resize format: {other}")),
        }
    }
}

/// Decoded server to client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Raw terminal bytes (base64 on the wire).
    Output(Vec<u8>),
    Pong,
    SetWindowTitle(String),
    /// Free-form JSON preferences, passed through untouched.
    SetPreferences(String),
    /// Server-suggested reconnect timeout in seconds.
    SetReconnect(i64),
}

impl ServerMessage {
    #[must_use]
    pub const fn kind(&self) -> ServerKind {
        match self {
            Self::Output(_) => ServerKind::Output,
            Self::Pong => ServerKind::Pong,
            Self::SetWindowTitle(_) => ServerKind::SetWindowTitle,
            Self::SetPreferences(_) => ServerKind::SetPreferences,
            Self::SetReconnect(_) => ServerKind::SetReconnect,
        }
    }

    /// Decode a tagged frame under the given revision.
    pub fn decode(revision: Revision, frame: &[u8]) -> Result<Self, DecodeError> {
        let (&tag, payload) = frame.split_first().ok_or(DecodeError::Empty)?;
        let kind = revision
            .server_kind(tag)
            .ok_or_else(|| DecodeError::UnknownTag(frame.to_vec()))?;

        Ok(match kind {
            ServerKind::Output => {
                Self::Output(base64::engine::general_purpose::STANDARD.decode(payload)?)
            }
            ServerKind::Pong => Self::Pong,
            ServerKind::SetWindowTitle => {
                Self::SetWindowTitle(String::from_utf8_lossy(payload).into_owned())
            }
            ServerKind::SetPreferences => {
                Self::SetPreferences(String::from_utf8_lossy(payload).into_owned())
            }
            ServerKind::SetReconnect => {
                let timeout =
                    serde_json::from_slice(payload).map_err(|source| DecodeError::Reconnect {
                        payload: String::from_utf8_lossy(payload).into_owned(),
                        source,
                    })?;
                Self::SetReconnect(timeout)
            }
        })
    }

    /// Encode as a tagged frame. Used by servers and test doubles.
    #[must_use]
    pub fn encode(&self, revision: Revision) -> Vec<u8> {
        let mut frame = vec![revision.server_tag(self.kind())];
        match self {
            Self::Output(data) => frame.extend_from_slice(
                base64::engine::general_purpose::STANDARD
                    .encode(data)
                    .as_bytes(),
            ),
            Self::Pong => {}
            Self::SetWindowTitle(title) => frame.extend_from_slice(title.as_bytes()),
            Self::SetPreferences(prefs) => frame.extend_from_slice(prefs.as_bytes()),
            Self::SetReconnect(timeout) => frame.extend_from_slice(timeout.to_string().as_bytes()),
        }
        frame
    }
}

/// Client to server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Input(Vec<u8>),
    Ping,
    ResizeTerminal(WindowSize),
}

impl ClientMessage {
    #[must_use]
    pub const fn kind(&self) -> ClientKind {
        match self {
            Self::Input(_) => ClientKind::Input,
            Self::Ping => ClientKind::Ping,
            Self::ResizeTerminal(_) => ClientKind::ResizeTerminal,
        }
    }

    /// Encode as a tagged frame.
    #[must_use]
    pub fn encode(&self, revision: Revision, resize_format: ResizeFormat) -> Vec<u8> {
        let tag = revision.client_tag(self.kind());
        match self {
            Self::Input(data) => {
                let mut frame = Vec::with_capacity(1 + data.len());
                frame.put_u8(tag);
                frame.put_slice(data);
                frame
            }
            Self::Ping => vec![tag],
            Self::ResizeTerminal(size) => {
                let mut frame = Vec::with_capacity(5);
                frame.put_u8(tag);
                match resize_format {
                    ResizeFormat::Binary => {
                        frame.put_u16(size.rows);
                        frame.put_u16(size.cols);
                    }
                    ResizeFormat::Json => {
                        // A struct of two u16 fields cannot fail to serialize.
                        if let Ok(json) = serde_json::to_vec(size) {
                            frame.put_slice(&json);
                        }
                    }
                }
                frame
            }
        }
    }

    /// Decode a tagged frame. Used by servers and test doubles.
    pub fn decode(
        revision: Revision,
        resize_format: ResizeFormat,
        frame: &[u8],
    ) -> Result<Self, DecodeError> {
        let (&tag, mut payload) = frame.split_first().ok_or(DecodeError::Empty)?;
        let kind = revision
            .client_kind(tag)
            .ok_or_else(|| DecodeError::UnknownTag(frame.to_vec()))?;

        Ok(match kind {
            ClientKind::Input => Self::Input(payload.to_vec()),
            ClientKind::Ping => Self::Ping,
            ClientKind::ResizeTerminal => match resize_format {
                ResizeFormat::Binary => {
                    if payload.len() != 4 {
                        return Err(DecodeError::WindowSize(payload.len()));
                    }
                    let rows = payload.get_u16();
                    let cols = payload.get_u16();
                    Self::ResizeTerminal(WindowSize { rows, cols })
                }
                ResizeFormat::Json => Self::ResizeTerminal(serde_json::from_slice(payload)?),
            },
        })
    }
}

/// The untagged first frame of every connection.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InitMessage {
    #[serde(rename = "AuthToken")]
    pub auth_token: String,
    #[serde(rename = "Arguments")]
    pub arguments: String,
}

impl InitMessage {
    /// Build from a token and the raw query string of the session URL.
    #[must_use]
    pub fn new(auth_token: impl Into<String>, query: Option<&str>) -> Self {
        Self {
            auth_token: auth_token.into(),
            arguments: format!("?{}", query.unwrap_or_default()),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
