// # Keystone v3 Session
//
// Password authentication against Keystone, scoped to a project:
//
// ```http
// POST /v3/auth/tokens
// {"auth": {"identity": {"methods": ["password"], ...}, "scope": {"project": {...}}}}
//
// 201 Created
// X-Subject-Token: <token>
// {"token": {"expires_at": "...", "catalog": [...]}}
// ```
//
// The token travels in the `X-Subject-Token` response header; the body
// carries its expiry and the service catalog the Neutron endpoint is picked
// from.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use midofix_core::config::DirectoryConfig;
use midofix_core::{Error, Result};
use serde::Deserialize;
use serde_json::json;

/// Response header carrying the issued token
pub const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

/// Catalog service type of Neutron
const NETWORK_SERVICE_TYPE: &str = "network";

/// Tokens this close to expiry are renewed before use
const EXPIRY_MARGIN_SECS: i64 = 60;

/// An authenticated session: token plus the endpoint it is used against
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub endpoint: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Whether the token can still be used at `now`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now + ChronoDuration::seconds(EXPIRY_MARGIN_SECS) < expires_at,
            None => true,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<REDACTED>")
            .field("endpoint", &self.endpoint)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenEnvelope {
    pub token: TokenBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenBody {
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub catalog: Vec<CatalogService>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CatalogService {
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CatalogEndpoint {
    pub interface: String,
    #[serde(default)]
    pub region_id: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    pub url: String,
}

/// URL of the token endpoint for a configured auth URL
///
/// Accepts the Keystone root as well as the `/v3` URL.
pub fn tokens_url(auth_url: &str) -> String {
    let base = auth_url.trim_end_matches('/');
    if base.ends_with("/v3") {
        format!("{}/auth/tokens", base)
    } else {
        format!("{}/v3/auth/tokens", base)
    }
}

/// Password authentication request body
pub fn password_auth_body(config: &DirectoryConfig) -> serde_json::Value {
    json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": config.username,
                        "domain": { "name": config.user_domain_name },
                        "password": config.password,
                    }
                }
            },
            "scope": {
                "project": {
                    "name": config.project_name,
                    "domain": { "name": config.project_domain_name },
                }
            }
        }
    })
}

/// Pick the Neutron endpoint out of a service catalog
pub(crate) fn select_network_endpoint(
    catalog: &[CatalogService],
    interface: &str,
    region: Option<&str>,
) -> Option<String> {
    catalog
        .iter()
        .filter(|service| service.service_type == NETWORK_SERVICE_TYPE)
        .flat_map(|service| service.endpoints.iter())
        .find(|endpoint| {
            endpoint.interface == interface
                && region.is_none_or(|region| {
                    endpoint.region_id.as_deref() == Some(region)
                        || endpoint.region.as_deref() == Some(region)
                })
        })
        .map(|endpoint| endpoint.url.clone())
}

/// Build a session from a token response
pub(crate) fn session_from_response(
    token: String,
    body: TokenEnvelope,
    config: &DirectoryConfig,
) -> Result<Session> {
    let endpoint = match config.endpoint_override {
        Some(ref endpoint) => endpoint.clone(),
        None => select_network_endpoint(
            &body.token.catalog,
            &config.interface,
            config.region_name.as_deref(),
        )
        .ok_or_else(|| {
            Error::directory(format!(
                "no {} network endpoint{} in the service catalog",
                config.interface,
                config
                    .region_name
                    .as_deref()
                    .map(|r| format!(" for region {}", r))
                    .unwrap_or_default()
            ))
        })?,
    };

    Ok(Session {
        token,
        endpoint: endpoint.trim_end_matches('/').to_string(),
        expires_at: body.token.expires_at,
    })
}
