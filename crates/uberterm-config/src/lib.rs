//! Configuration for uberterm connections.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt as _;

use eyre::WrapErr as _;
use uberterm_protocol::{ResizeFormat, Revision};

/// Default detach sequence: Ctrl-P followed by Ctrl-Q.
pub const DEFAULT_DETACH_KEYS: &str = "ctrl-p,ctrl-q";

/// Path appended to bare server URLs.
pub const DEFAULT_PATH_SUFFIX: &str = "/terminal/";

/// Main configuration structure.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Config {
    /// Local key sequence that ends the session without telling the server.
    pub detach_keys: String,

    /// Layout of resize frames sent to the server.
    pub resize_format: ResizeFormat,

    /// Per-alias connection settings. Keys may be wildcard patterns.
    pub hosts: BTreeMap<String, HostConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            detach_keys: DEFAULT_DETACH_KEYS.to_string(),
            resize_format: ResizeFormat::default(),
            hosts: BTreeMap::new(),
        }
    }
}

/// Connection settings for one host alias. Unset fields fall through to
/// lower-priority layers when merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct HostConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Instance directory callsign, used when no URL is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callsign: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Sent as the `X-Admin-Password` header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_tls_verify: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_proxy_from_env: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Revision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_suffix: Option<String>,
}

impl HostConfig {
    /// Overlay `other` on top of `self`: every field set in `other` wins.
    pub fn merge(&mut self, other: &HostConfig) {
        fn overlay<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
            if src.is_some() {
                dst.clone_from(src);
            }
        }

        overlay(&mut self.url, &other.url);
        overlay(&mut self.callsign, &other.callsign);
        overlay(&mut self.user, &other.user);
        overlay(&mut self.password, &other.password);
        overlay(&mut self.admin_password, &other.admin_password);
        overlay(&mut self.skip_tls_verify, &other.skip_tls_verify);
        overlay(&mut self.use_proxy_from_env, &other.use_proxy_from_env);
        overlay(&mut self.ws_origin, &other.ws_origin);
        overlay(&mut self.protocol, &other.protocol);
        overlay(&mut self.path_suffix, &other.path_suffix);
    }
}

impl Config {
    /// Look up the host block for an alias: exact match first, then the most
    /// specific wildcard pattern, then `*`.
    #[must_use]
    pub fn host(&self, alias: &str) -> Option<&HostConfig> {
        if let Some(host) = self.hosts.get(alias) {
            return Some(host);
        }

        self.hosts
            .iter()
            .filter(|(pattern, _)| pattern.as_str() != "*" && matches_pattern(pattern, alias))
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(_, host)| host)
            .or_else(|| self.hosts.get("*"))
    }

    /// Effective settings for an alias: `*` defaults overlaid by the matched
    /// host block. Returns `None` if nothing matched.
    #[must_use]
    pub fn resolve(&self, alias: &str) -> Option<HostConfig> {
        let host = self.host(alias)?;
        let mut resolved = self.hosts.get("*").cloned().unwrap_or_default();
        resolved.merge(host);
        Some(resolved)
    }

    /// Defaults applied to targets given as plain URLs.
    #[must_use]
    pub fn defaults(&self) -> HostConfig {
        self.hosts.get("*").cloned().unwrap_or_default()
    }
}

/// Simple ssh-style wildcard matching: `*`, `*.suffix` and `prefix.*`.
#[must_use]
pub fn matches_pattern(pattern: &str, alias: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        if suffix.starts_with('.') {
            return alias.ends_with(suffix);
        }
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return alias
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'));
    }
    pattern == alias
}

/// Parse a detach sequence like "ctrl-p,ctrl-q" into control bytes.
///
/// `ctrl-<letter>` maps to the letter's control code, a single character maps
/// to itself, anything else is ignored.
#[must_use]
pub fn parse_detach_keys(keys: &str) -> Vec<u8> {
    keys.split(',')
        .filter_map(|part| {
            let part = part.trim().to_ascii_lowercase();
            if let Some(key) = part.strip_prefix("ctrl-") {
                let mut chars = key.chars();
                return match (chars.next(), chars.next()) {
                    (Some(c @ 'a'..='z'), None) => Some((c as u8) & 0x1f),
                    _ => {
                        tracing::warn!("ignoring unknown detach key: {part}");
                        None
                    }
                };
            }
            match part.as_bytes() {
                [byte] => Some(*byte),
                [] => None,
                _ => {
                    tracing::warn!("ignoring unknown detach key: {part}");
                    None
                }
            }
        })
        .collect()
}

/// Returns the config file path: ~/.config/uberterm/config.toml
#[must_use]
pub fn config_path() -> std::path::PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("~/.config"))
        .join("uberterm")
        .join("config.toml")
}

/// Load configuration from default path, falling back to defaults if not found.
pub fn load() -> eyre::Result<Config> {
    load_from(&config_path())
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_from(path: &std::path::Path) -> eyre::Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .wrap_err_with(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    } else {
        Ok(Config::default())
    }
}

const EXAMPLE_CONFIG: &str = r#"# uberterm configuration
#
# Connect to an alias with: uberterm <alias>
# This file may hold passwords; keep it readable only by you (chmod 600).

# detach_keys = "ctrl-p,ctrl-q"
# resize_format = "binary"        # or "json" for servers expecting {"rows":..,"columns":..}

# [hosts.local]
# url = "http://localhost:8080"
# user = "admin"
# password = "mypassword"
# admin_password = "secretadmin"
# path_suffix = "/terminal/"

# [hosts.production]
# url = "https://gotty.example.com:8080"
# ws_origin = "https://gotty.example.com:8080"
# protocol = "v2"

# [hosts.m9psy]
# callsign = "M9PSY"
# admin_password = "mypassword"

# [hosts."*.internal"]
# user = "admin"
# skip_tls_verify = true
# use_proxy_from_env = true

# Defaults for every host (lowest priority)
# [hosts."*"]
# skip_tls_verify = false
# path_suffix = "/terminal/"
"#;

fn write_private(path: &std::path::Path, content: &str) -> eyre::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create config directory {}", dir.display()))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .wrap_err_with(|| format!("failed to open config file {}", path.display()))?;
    file.write_all(content.as_bytes())
        .wrap_err_with(|| format!("failed to write config file {}", path.display()))?;
    Ok(())
}

/// Create a commented example config if none exists yet.
/// Returns true if a file was created.
pub fn ensure_exists(path: &std::path::Path) -> eyre::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    write_private(path, EXAMPLE_CONFIG)?;
    tracing::info!("created config file with examples at {}", path.display());
    Ok(true)
}

/// Save or replace one host block, keeping the rest of the file's settings.
pub fn save_host(path: &std::path::Path, alias: &str, host: HostConfig) -> eyre::Result<()> {
    let mut config = load_from(path)?;
    config.hosts.insert(alias.to_string(), host);
    let content = toml::to_string_pretty(&config).wrap_err("failed to serialize config")?;
    write_private(path, &content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        toml::from_str(
            r#"
            [hosts.local]
            url = "http://localhost:8080"
            user = "admin"

            [hosts."*.internal"]
            skip_tls_verify = true

            [hosts."lab.*"]
            protocol = "v1"

            [hosts."*"]
            skip_tls_verify = false
            path_suffix = "/term/"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.detach_keys, "ctrl-p,ctrl-q");
        assert_eq!(config.resize_format, ResizeFormat::Binary);
        assert!(config.hosts.is_empty());
    }

    #[test]
    fn test_exact_match_wins() {
        let config = sample();
        let host = config.host("local").unwrap();
        assert_eq!(host.url.as_deref(), Some("http://localhost:8080"));
    }

    #[test]
    fn test_wildcard_matches() {
        let config = sample();
        assert_eq!(config.host("db.internal").unwrap().skip_tls_verify, Some(true));
        assert_eq!(config.host("lab.west").unwrap().protocol, Some(Revision::V1));
        assert_eq!(
            config.host("elsewhere").unwrap().path_suffix.as_deref(),
            Some("/term/")
        );
    }

    #[test]
    fn test_resolve_overlays_defaults() {
        let config = sample();
        let resolved = config.resolve("db.internal").unwrap();
        assert_eq!(resolved.skip_tls_verify, Some(true));
        assert_eq!(resolved.path_suffix.as_deref(), Some("/term/"));
    }

    #[test]
    fn test_merge_can_turn_flags_off() {
        let mut base = HostConfig {
            skip_tls_verify: Some(true),
            user: Some("admin".to_string()),
            ..HostConfig::default()
        };
        base.merge(&HostConfig {
            skip_tls_verify: Some(false),
            ..HostConfig::default()
        });
        assert_eq!(base.skip_tls_verify, Some(false));
        assert_eq!(base.user.as_deref(), Some("admin"));
    }

    #[test]
    fn test_matches_pattern() {
        assert!(matches_pattern("*", "anything"));
        assert!(matches_pattern("*.internal", "db.internal"));
        assert!(!matches_pattern("*.internal", "internal"));
        assert!(matches_pattern("lab.*", "lab.east"));
        assert!(!matches_pattern("lab.*", "prod.east"));
        assert!(matches_pattern("exact", "exact"));
    }

    #[test]
    fn test_parse_detach_keys_default() {
        assert_eq!(parse_detach_keys(DEFAULT_DETACH_KEYS), vec![0x10, 0x11]);
    }

    #[test]
    fn test_parse_detach_keys_mixed() {
        assert_eq!(parse_detach_keys(" Ctrl-A , x,ctrl-z"), vec![0x01, b'x', 0x1a]);
        assert_eq!(parse_detach_keys("ctrl-p,escape,ctrl-q"), vec![0x10, 0x11]);
        assert!(parse_detach_keys("").is_empty());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.detach_keys, DEFAULT_DETACH_KEYS);
    }

    #[test]
    fn test_save_host_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uberterm").join("config.toml");
        let host = HostConfig {
            url: Some("https://gotty.example.com/terminal/".to_string()),
            admin_password: Some("secret".to_string()),
            protocol: Some(Revision::V2),
            ..HostConfig::default()
        };
        save_host(&path, "prod", host.clone()).unwrap();
        save_host(&path, "dev", HostConfig::default()).unwrap();

        let config = load_from(&path).unwrap();
        assert_eq!(config.hosts.get("prod"), Some(&host));
        assert!(config.hosts.contains_key("dev"));

        use std::os::unix::fs::PermissionsExt as _;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_ensure_exists_writes_parseable_example() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        assert!(ensure_exists(&path).unwrap());
        assert!(!ensure_exists(&path).unwrap());
        let config = load_from(&path).unwrap();
        assert!(config.hosts.is_empty());
    }
}
