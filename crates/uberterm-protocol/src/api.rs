//! JSON bodies of the control-plane REST endpoints.

/// A tmux session on the remote host.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub window_name: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub windows: u32,
    #[serde(default)]
    pub attached: bool,
    #[serde(default)]
    pub last_active: String,
}

/// Response of `GET api/sessions`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SessionList {
    #[serde(default)]
    pub sessions: Vec<SessionInfo>,
    #[serde(default)]
    pub count: usize,
}

/// Response of session actions such as `DELETE api/sessions/destroy`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionAction {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

/// A publicly listed instance from the instance directory.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Instance {
    #[serde(default)]
    pub id: String,
    pub callsign: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub public_url: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub load_status: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub max_clients: u32,
    #[serde(default)]
    pub available_clients: u32,
}

/// Response of the instance directory.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct InstanceList {
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub instances: Vec<Instance>,
}
