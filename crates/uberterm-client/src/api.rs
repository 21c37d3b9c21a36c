//! Control-plane REST calls: session management and instance discovery.

use uberterm_protocol::api::{Instance, InstanceList, SessionAction, SessionList};

use crate::handshake::{authorize, http_client};
use crate::{Client, ClientOptions, Error, Result};

pub use uberterm_protocol::api::SessionInfo;

/// Public directory of known instances.
pub const INSTANCES_URL: &str = "https://instances.ubersdr.org/api/instances";

async fn json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await?;
    if status != reqwest::StatusCode::OK {
        return Err(Error::Status {
            status: status.as_u16(),
            body: body.trim().to_string(),
        });
    }
    Ok(serde_json::from_str(&body)?)
}

impl Client {
    /// `GET api/sessions`.
    pub async fn list_sessions(&self) -> Result<SessionList> {
        let options = self.options();
        let url = self.endpoint().api_url("api/sessions");
        tracing::debug!("listing sessions at {url}");
        let request = authorize(http_client(options)?.get(url), options)?;
        json(request.send().await?).await
    }

    /// `DELETE api/sessions/destroy?name=<name>`.
    pub async fn destroy_session(&self, name: &str) -> Result<SessionAction> {
        let options = self.options();
        let mut url = self.endpoint().api_url("api/sessions/destroy");
        url.query_pairs_mut().append_pair("name", name);
        tracing::debug!("destroying session {name}");
        let request = authorize(http_client(options)?.delete(url), options)?;
        let action: SessionAction = json(request.send().await?).await?;
        if !action.success {
            return Err(Error::Server(action.message));
        }
        Ok(action)
    }

    /// Find the session whose window name matches `window`.
    pub async fn find_session_by_window(&self, window: &str) -> Result<Option<SessionInfo>> {
        let list = self.list_sessions().await?;
        Ok(list
            .sessions
            .into_iter()
            .find(|session| session.window_name == window))
    }
}

/// Fetch the public instance directory.
pub async fn list_instances(options: &ClientOptions) -> Result<InstanceList> {
    list_instances_from(INSTANCES_URL, options).await
}

pub async fn list_instances_from(url: &str, options: &ClientOptions) -> Result<InstanceList> {
    tracing::debug!("fetching instance list from {url}");
    let response = http_client(options)?.get(url).send().await?;
    json(response).await
}

/// Look up an instance by callsign, ignoring case.
pub async fn find_instance_by_callsign(callsign: &str, options: &ClientOptions) -> Result<Instance> {
    let list = list_instances(options).await?;
    find_callsign(list, callsign)
}

fn find_callsign(list: InstanceList, callsign: &str) -> Result<Instance> {
    list.instances
        .into_iter()
        .find(|instance| instance.callsign.eq_ignore_ascii_case(callsign))
        .ok_or_else(|| Error::InstanceNotFound(callsign.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(callsign: &str) -> Instance {
        serde_json::from_value(serde_json::json!({
            "callsign": callsign,
            "public_url": format!("https://{}.example.com", callsign.to_lowercase()),
        }))
        .unwrap()
    }

    #[test]
    fn test_find_callsign_ignores_case() {
        let list = InstanceList {
            count: 2,
            instances: vec![instance("M9PSY"), instance("G4ABC")],
        };
        let found = find_callsign(list, "m9psy").unwrap();
        assert_eq!(found.public_url, "https://m9psy.example.com");
    }

    #[test]
    fn test_unknown_callsign() {
        let list = InstanceList::default();
        assert!(matches!(
            find_callsign(list, "N0CALL"),
            Err(Error::InstanceNotFound(c)) if c == "N0CALL"
        ));
    }
}
