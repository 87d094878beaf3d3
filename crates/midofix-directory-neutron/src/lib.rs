// # Neutron Network Directory
//
// This crate resolves ports through the OpenStack Networking API, using a
// Keystone v3 session for authentication.
//
// ## Behaviour
//
// - One `GET /v2.0/ports/{id}` per reconciliation; port data is never cached
// - The Keystone token is cached until shortly before it expires
// - A 401 from Neutron drops the cached token and retries once with a new one
// - HTTP timeout of 30 seconds on every request
//
// ## Status Mapping
//
// | Status    | Result                    |
// |-----------|---------------------------|
// | 200       | `Ok(Some(port))`          |
// | 404       | `Ok(None)`                |
// | 401       | re-authenticate, retry once, then `Error::Authentication` |
// | 403       | `Error::Authentication`   |
// | 429       | `Error::RateLimited`      |
// | other     | `Error::Directory`        |
//
// ## Security
//
// - Password and token NEVER appear in logs or Debug output
//
// ## API Reference
//
// - Identity v3: https://docs.openstack.org/api-ref/identity/v3/
// - Networking v2.0 ports: https://docs.openstack.org/api-ref/network/v2/#ports

pub mod keystone;

use async_trait::async_trait;
use midofix_core::config::DirectoryConfig;
use midofix_core::model::Port;
use midofix_core::traits::NetworkDirectory;
use midofix_core::{Error, Result};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::keystone::{Session, TokenEnvelope};

/// Default HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Request header carrying the token on service calls
const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

/// Result of a single port request
enum PortLookup {
    Done(Option<Port>),
    TokenRejected,
}

#[derive(Debug, Deserialize)]
struct PortEnvelope {
    port: PortBody,
}

#[derive(Debug, Deserialize)]
struct PortBody {
    id: String,
    network_id: String,
    mac_address: String,
    #[serde(default)]
    fixed_ips: Vec<FixedIp>,
}

#[derive(Debug, Deserialize)]
struct FixedIp {
    ip_address: String,
}

impl From<PortBody> for Port {
    fn from(body: PortBody) -> Self {
        Port::new(
            body.id,
            body.network_id,
            body.mac_address,
            body.fixed_ips.into_iter().map(|ip| ip.ip_address),
        )
    }
}

/// Neutron-backed network directory
///
/// Shared by every concurrent reconciliation; only the Keystone session is
/// mutable, behind a lock.
pub struct NeutronDirectory {
    config: DirectoryConfig,
    client: reqwest::Client,
    session: RwLock<Option<Session>>,
}

// Custom Debug implementation that hides credentials
impl std::fmt::Debug for NeutronDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeutronDirectory")
            .field("auth_url", &self.config.auth_url)
            .field("username", &self.config.username)
            .field("password", &"<REDACTED>")
            .field("project_name", &self.config.project_name)
            .field("interface", &self.config.interface)
            .field("region_name", &self.config.region_name)
            .finish()
    }
}

impl NeutronDirectory {
    /// Create a new directory client
    ///
    /// No request is made until the first lookup.
    pub fn new(config: DirectoryConfig) -> Result<Self> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            client,
            session: RwLock::new(None),
        })
    }

    /// A usable session, authenticating if the cached one is missing or expiring
    async fn session(&self) -> Result<Session> {
        let now = chrono::Utc::now();
        if let Some(session) = self.session.read().await.as_ref() {
            if session.is_valid_at(now) {
                return Ok(session.clone());
            }
        }

        let mut guard = self.session.write().await;
        // Another lookup may have renewed it while we waited
        if let Some(session) = guard.as_ref() {
            if session.is_valid_at(now) {
                return Ok(session.clone());
            }
        }

        let session = self.authenticate().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn invalidate(&self, stale: &Session) {
        let mut guard = self.session.write().await;
        if guard.as_ref().is_some_and(|s| s.token == stale.token) {
            *guard = None;
        }
    }

    /// Issue a project-scoped token
    ///
    /// # API Call
    ///
    /// ```http
    /// POST /v3/auth/tokens
    /// Content-Type: application/json
    /// ```
    async fn authenticate(&self) -> Result<Session> {
        let url = keystone::tokens_url(&self.config.auth_url);
        tracing::debug!("Authenticating to Keystone at {}", url);

        let response = self
            .client
            .post(&url)
            .json(&keystone::password_auth_body(&self.config))
            .send()
            .await
            .map_err(|e| Error::directory(format!("Keystone request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());

            return match status.as_u16() {
                401 | 403 => Err(Error::auth(format!(
                    "Keystone rejected the credentials of {}. Status: {}",
                    self.config.username, status
                ))),
                429 => Err(Error::rate_limited(format!(
                    "Keystone rate limit exceeded. Status: {}",
                    status
                ))),
                _ => Err(Error::directory(format!(
                    "Keystone authentication failed: {} - {}",
                    status, error_text
                ))),
            };
        }

        let token = response
            .headers()
            .get(keystone::SUBJECT_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::directory("Keystone response carries no subject token"))?;

        let body: TokenEnvelope = response
            .json()
            .await
            .map_err(|e| Error::directory(format!("Failed to parse Keystone response: {}", e)))?;

        let session = keystone::session_from_response(token, body, &self.config)?;
        tracing::debug!(
            "Authenticated, network endpoint {} (expires {:?})",
            session.endpoint,
            session.expires_at
        );
        Ok(session)
    }

    /// Single port lookup with the given session
    ///
    /// # API Call
    ///
    /// ```http
    /// GET /v2.0/ports/:port_id
    /// X-Auth-Token: <token>
    /// ```
    async fn get_port(&self, session: &Session, port_id: &str) -> Result<PortLookup> {
        let url = port_url(&session.endpoint, port_id)?;

        let response = self
            .client
            .get(url)
            .header(AUTH_TOKEN_HEADER, &session.token)
            .send()
            .await
            .map_err(|e| Error::directory(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());

            return match status.as_u16() {
                401 => Ok(PortLookup::TokenRejected),
                403 => Err(Error::auth(format!(
                    "Not allowed to read port {}. Status: {}",
                    port_id, status
                ))),
                404 => Ok(PortLookup::Done(None)),
                429 => Err(Error::rate_limited(format!(
                    "Neutron rate limit exceeded. Status: {}",
                    status
                ))),
                500..=599 => Err(Error::directory(format!(
                    "Neutron server error (transient): {} - {}",
                    status, error_text
                ))),
                _ => Err(Error::directory(format!(
                    "Port lookup failed: {} - {}",
                    status, error_text
                ))),
            };
        }

        let body: PortEnvelope = response
            .json()
            .await
            .map_err(|e| Error::directory(format!("Failed to parse port {}: {}", port_id, e)))?;

        Ok(PortLookup::Done(Some(body.port.into())))
    }
}

/// Port resource URL; the id is encoded as a single path segment
fn port_url(endpoint: &str, port_id: &str) -> Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(endpoint)
        .map_err(|e| Error::directory(format!("Invalid Neutron endpoint {}: {}", endpoint, e)))?;
    url.path_segments_mut()
        .map_err(|_| Error::directory(format!("Neutron endpoint {} cannot hold a path", endpoint)))?
        .pop_if_empty()
        .extend(["v2.0", "ports"])
        .push(port_id);
    Ok(url)
}

#[async_trait]
impl NetworkDirectory for NeutronDirectory {
    async fn fetch_port(&self, port_id: &str) -> Result<Option<Port>> {
        let session = self.session().await?;
        match self.get_port(&session, port_id).await? {
            PortLookup::Done(port) => return Ok(port),
            PortLookup::TokenRejected => {
                tracing::debug!("Token rejected by Neutron, re-authenticating");
                self.invalidate(&session).await;
            }
        }

        let session = self.session().await?;
        match self.get_port(&session, port_id).await? {
            PortLookup::Done(port) => Ok(port),
            PortLookup::TokenRejected => Err(Error::auth(format!(
                "Neutron rejected a freshly issued token for {}",
                self.config.username
            ))),
        }
    }

    fn directory_name(&self) -> &'static str {
        "neutron"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn config(server: &MockServer) -> DirectoryConfig {
        config_for(server.url("/v3"))
    }

    fn config_for(auth_url: String) -> DirectoryConfig {
        DirectoryConfig {
            auth_url,
            username: "mido-fixer".to_string(),
            password: "s3cr3t-password".to_string(),
            project_name: "service".to_string(),
            user_domain_name: "Default".to_string(),
            project_domain_name: "Default".to_string(),
            region_name: None,
            interface: "public".to_string(),
            endpoint_override: None,
        }
    }

    fn mock_keystone<'a>(server: &'a MockServer, token: &str) -> httpmock::Mock<'a> {
        let catalog = json!({
            "token": {
                "expires_at": "2999-01-01T00:00:00.000000Z",
                "catalog": [{
                    "type": "network",
                    "endpoints": [
                        { "interface": "public", "region_id": "RegionOne", "url": server.base_url() }
                    ]
                }]
            }
        });
        let token = token.to_string();
        server.mock(|when, then| {
            when.method(POST)
                .path("/v3/auth/tokens")
                .json_body_partial(r#"{"auth": {"scope": {"project": {"name": "service"}}}}"#);
            then.status(201)
                .header("Content-Type", "application/json")
                .header("X-Subject-Token", token.as_str())
                .json_body(catalog);
        })
    }

    fn port_body() -> serde_json::Value {
        json!({
            "port": {
                "id": "p1",
                "network_id": "n1",
                "mac_address": "fa:16:3e:00:00:01",
                "fixed_ips": [
                    { "subnet_id": "s4", "ip_address": "10.0.0.5" },
                    { "subnet_id": "s6", "ip_address": "2001:db8::5" }
                ],
                "status": "ACTIVE"
            }
        })
    }

    #[tokio::test]
    async fn test_fetch_port() {
        let server = MockServer::start();
        let auth_mock = mock_keystone(&server, "tok-1");
        let port_mock = server.mock(|when, then| {
            when.method(GET)
                .path("/v2.0/ports/p1")
                .header("X-Auth-Token", "tok-1");
            then.status(200)
                .header("Content-Type", "application/json")
                .json_body(port_body());
        });

        let directory = NeutronDirectory::new(config(&server)).unwrap();
        let port = directory.fetch_port("p1").await.unwrap().unwrap();

        assert_eq!(port.id, "p1");
        assert_eq!(port.network_id, "n1");
        assert_eq!(port.mac_address, "fa:16:3e:00:00:01");
        assert!(port.ip_addresses.contains("10.0.0.5"));
        assert!(port.ip_addresses.contains("2001:db8::5"));

        // Second lookup reuses the token
        directory.fetch_port("p1").await.unwrap();
        auth_mock.assert_hits(1);
        port_mock.assert_hits(2);
    }

    #[tokio::test]
    async fn test_missing_port_is_none() {
        let server = MockServer::start();
        mock_keystone(&server, "tok-1");
        server.mock(|when, then| {
            when.method(GET).path("/v2.0/ports/gone");
            then.status(404)
                .json_body(json!({"NeutronError": {"type": "PortNotFound"}}));
        });

        let directory = NeutronDirectory::new(config(&server)).unwrap();
        assert_eq!(directory.fetch_port("gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejected_token_is_renewed_once() {
        let server = MockServer::start();
        let auth_mock = mock_keystone(&server, "fresh");
        let stale_mock = server.mock(|when, then| {
            when.method(GET)
                .path("/v2.0/ports/p1")
                .header("X-Auth-Token", "stale");
            then.status(401);
        });
        let fresh_mock = server.mock(|when, then| {
            when.method(GET)
                .path("/v2.0/ports/p1")
                .header("X-Auth-Token", "fresh");
            then.status(200).json_body(port_body());
        });

        let directory = NeutronDirectory::new(config(&server)).unwrap();
        *directory.session.write().await = Some(Session {
            token: "stale".to_string(),
            endpoint: server.base_url(),
            expires_at: None,
        });

        let port = directory.fetch_port("p1").await.unwrap();

        assert!(port.is_some());
        stale_mock.assert_hits(1);
        fresh_mock.assert_hits(1);
        auth_mock.assert_hits(1);
    }

    #[tokio::test]
    async fn test_persistent_401_is_an_auth_error() {
        let server = MockServer::start();
        let auth_mock = mock_keystone(&server, "tok-1");
        server.mock(|when, then| {
            when.method(GET).path("/v2.0/ports/p1");
            then.status(401);
        });

        let directory = NeutronDirectory::new(config(&server)).unwrap();
        let result = directory.fetch_port("p1").await;

        assert!(matches!(result, Err(Error::Authentication(_))));
        auth_mock.assert_hits(2);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start();
        mock_keystone(&server, "tok-1");
        server.mock(|when, then| {
            when.method(GET).path("/v2.0/ports/forbidden");
            then.status(403);
        });
        server.mock(|when, then| {
            when.method(GET).path("/v2.0/ports/busy");
            then.status(429);
        });
        server.mock(|when, then| {
            when.method(GET).path("/v2.0/ports/broken");
            then.status(503).body("Service Unavailable");
        });

        let directory = NeutronDirectory::new(config(&server)).unwrap();

        assert!(matches!(
            directory.fetch_port("forbidden").await,
            Err(Error::Authentication(_))
        ));
        assert!(matches!(
            directory.fetch_port("busy").await,
            Err(Error::RateLimited(_))
        ));
        assert!(matches!(
            directory.fetch_port("broken").await,
            Err(Error::Directory(ref msg)) if msg.contains("503")
        ));
    }

    #[tokio::test]
    async fn test_keystone_rejects_credentials() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v3/auth/tokens");
            then.status(401)
                .json_body(json!({"error": {"code": 401, "title": "Unauthorized"}}));
        });

        let directory = NeutronDirectory::new(config(&server)).unwrap();
        let result = directory.fetch_port("p1").await;

        assert!(matches!(result, Err(Error::Authentication(_))));
    }

    #[tokio::test]
    async fn test_endpoint_override() {
        let keystone = MockServer::start();
        let neutron = MockServer::start();
        keystone.mock(|when, then| {
            when.method(POST).path("/v3/auth/tokens");
            then.status(201)
                .header("X-Subject-Token", "tok-1")
                .json_body(json!({"token": {"catalog": []}}));
        });
        let port_mock = neutron.mock(|when, then| {
            when.method(GET).path("/v2.0/ports/p1");
            then.status(200).json_body(port_body());
        });

        let directory = NeutronDirectory::new(DirectoryConfig {
            endpoint_override: Some(neutron.base_url()),
            ..config(&keystone)
        })
        .unwrap();

        assert!(directory.fetch_port("p1").await.unwrap().is_some());
        port_mock.assert();
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = NeutronDirectory::new(DirectoryConfig {
            password: String::new(),
            ..config_for("http://keystone:5000/v3".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_password_not_exposed_in_debug() {
        let directory =
            NeutronDirectory::new(config_for("http://keystone:5000/v3".to_string())).unwrap();

        let debug_str = format!("{:?}", directory);
        assert!(!debug_str.contains("s3cr3t-password"));
        assert!(debug_str.contains("NeutronDirectory"));
        assert_eq!(directory.directory_name(), "neutron");
    }

    #[test]
    fn test_port_id_stays_one_path_segment() {
        let url = port_url("http://neutron:9696", "p1").unwrap();
        assert_eq!(url.as_str(), "http://neutron:9696/v2.0/ports/p1");

        let url = port_url("http://neutron:9696/networking", "p1/../../tokens?x=1#y").unwrap();
        assert_eq!(
            url.as_str(),
            "http://neutron:9696/networking/v2.0/ports/p1%2F..%2F..%2Ftokens%3Fx=1%23y"
        );
        assert_eq!(url.path_segments().unwrap().count(), 4);
        assert_eq!(url.query(), None);

        assert!(port_url("not a url", "p1").is_err());
    }
}
