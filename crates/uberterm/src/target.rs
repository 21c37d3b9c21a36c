//! Turning a command-line target into a URL and effective host settings.

use uberterm_config::{Config, HostConfig};

/// Where to connect before any instance lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Url(String),
    /// Resolved through the public instance directory.
    Callsign(String),
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub location: Location,
    /// `*` defaults < matched host block < command-line overrides.
    pub host: HostConfig,
}

/// Resolve an alias or URL. A callsign in `overrides` beats everything; an
/// alias with a URL or callsign beats treating the target as a URL.
pub fn resolve(
    config: &Config,
    target: Option<&str>,
    overrides: &HostConfig,
) -> eyre::Result<Resolved> {
    let configured = target.and_then(|t| config.resolve(t));
    let mut host = configured.clone().unwrap_or_else(|| config.defaults());
    host.merge(overrides);

    let location = if let Some(callsign) = &overrides.callsign {
        Location::Callsign(callsign.clone())
    } else if let Some(url) = configured.as_ref().and_then(|c| c.url.clone()) {
        Location::Url(url)
    } else if let Some(callsign) = configured.as_ref().and_then(|c| c.callsign.clone()) {
        Location::Callsign(callsign)
    } else if let Some(target) = target {
        Location::Url(target.to_string())
    } else {
        eyre::bail!("URL, host alias, or --callsign required");
    };

    Ok(Resolved { location, host })
}

/// Session query parameters: `session=<id>` and, for new sessions,
/// `name=<window>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub session: String,
    pub window: Option<String>,
}

/// An explicit session wins. A new session gets a timestamp id and either the
/// requested window name or a generated one.
pub fn session_params(
    session: Option<String>,
    new_session: Option<String>,
    now: i64,
    generate_name: impl FnOnce() -> String,
) -> Option<SessionParams> {
    match (session, new_session) {
        (Some(session), _) => Some(SessionParams {
            session,
            window: None,
        }),
        (None, Some(name)) => {
            let window = if name.is_empty() {
                generate_name()
            } else {
                name
            };
            Some(SessionParams {
                session: now.to_string(),
                window: Some(window),
            })
        }
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        toml::from_str(
            r#"
            [hosts.local]
            url = "http://localhost:8080"
            user = "admin"

            [hosts.radio]
            callsign = "M9PSY"

            [hosts."*"]
            skip_tls_verify = true
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_alias_url() {
        let resolved = resolve(&config(), Some("local"), &HostConfig::default()).unwrap();
        assert_eq!(
            resolved.location,
            Location::Url("http://localhost:8080".to_string())
        );
        assert_eq!(resolved.host.user.as_deref(), Some("admin"));
        assert_eq!(resolved.host.skip_tls_verify, Some(true));
    }

    #[test]
    fn test_alias_callsign() {
        let resolved = resolve(&config(), Some("radio"), &HostConfig::default()).unwrap();
        assert_eq!(resolved.location, Location::Callsign("M9PSY".to_string()));
    }

    #[test]
    fn test_plain_url_gets_defaults() {
        let resolved =
            resolve(&config(), Some("https://example.com"), &HostConfig::default()).unwrap();
        assert_eq!(
            resolved.location,
            Location::Url("https://example.com".to_string())
        );
        assert_eq!(resolved.host.skip_tls_verify, Some(true));
    }

    #[test]
    fn test_command_line_wins() {
        let overrides = HostConfig {
            user: Some("root".to_string()),
            skip_tls_verify: Some(false),
            ..HostConfig::default()
        };
        let resolved = resolve(&config(), Some("local"), &overrides).unwrap();
        assert_eq!(resolved.host.user.as_deref(), Some("root"));
        assert_eq!(resolved.host.skip_tls_verify, Some(false));
    }

    #[test]
    fn test_callsign_flag_wins() {
        let overrides = HostConfig {
            callsign: Some("G4ABC".to_string()),
            ..HostConfig::default()
        };
        let resolved = resolve(&config(), Some("local"), &overrides).unwrap();
        assert_eq!(resolved.location, Location::Callsign("G4ABC".to_string()));
    }

    #[test]
    fn test_missing_target() {
        assert!(resolve(&config(), None, &HostConfig::default()).is_err());
    }

    #[test]
    fn test_session_params() {
        assert_eq!(session_params(None, None, 1, String::new), None);

        assert_eq!(
            session_params(Some("main".to_string()), Some(String::new()), 1, String::new),
            Some(SessionParams {
                session: "main".to_string(),
                window: None,
            })
        );

        assert_eq!(
            session_params(None, Some(String::new()), 1_700_000_000, || "brave-otter"
                .to_string()),
            Some(SessionParams {
                session: "1700000000".to_string(),
                window: Some("brave-otter".to_string()),
            })
        );

        assert_eq!(
            session_params(None, Some("build".to_string()), 5, || unreachable!()),
            Some(SessionParams {
                session: "5".to_string(),
                window: Some("build".to_string()),
            })
        );
    }
}
