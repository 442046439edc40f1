//! ICE server configuration.
//!
//! TURN credentials are short-lived and fetched from an HTTP endpoint;
//! the resulting configuration is cached for the life of the provider.
//! Any failure falls back to a public STUN server so that calls on
//! friendly networks still connect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::OnceCell;

/// Public STUN fallback used when the credential endpoint is unavailable
const FALLBACK_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Timeout for the credential endpoint request
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from the ICE credential endpoint
#[derive(Debug, thiserror::Error)]
pub enum IceError {
    /// The HTTP request failed or returned a non-success status
    #[error("ice endpoint request failed: {0}")]
    Endpoint(String),
}

/// One ICE server entry (STUN or TURN)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs; the endpoint may return a single string or an array
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    /// TURN username, when required
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential, when required
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    fn is_stun(&self) -> bool {
        self.urls.iter().any(|u| u.starts_with("stun"))
    }

    fn is_turn(&self) -> bool {
        self.urls.iter().any(|u| u.starts_with("turn"))
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

/// Whether to allow all candidate types or relay-only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    /// Host, reflexive and relay candidates
    All,
    /// Relay candidates only
    Relay,
}

impl Default for IceTransportPolicy {
    fn default() -> Self {
        Self::All
    }
}

/// Configuration handed to the peer-connection backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcConfig {
    /// Selected ICE servers
    pub ice_servers: Vec<IceServer>,
    /// Candidate gathering policy
    #[serde(default)]
    pub transport_policy: IceTransportPolicy,
}

impl RtcConfig {
    /// Public-STUN-only fallback configuration
    pub fn fallback() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec![FALLBACK_STUN_URL.to_string()],
                username: None,
                credential: None,
            }],
            transport_policy: IceTransportPolicy::All,
        }
    }
}

/// Source of ICE server entries
#[async_trait]
pub trait IceEndpoint: Send + Sync {
    /// Fetch the current ICE server list
    ///
    /// # Errors
    ///
    /// Returns [`IceError::Endpoint`] when the source is unreachable or
    /// returns an unusable response.
    async fn fetch(&self) -> Result<Vec<IceServer>, IceError>;
}

/// HTTP implementation of [`IceEndpoint`]
pub struct HttpIceEndpoint {
    client: reqwest::Client,
    url: String,
}

impl HttpIceEndpoint {
    /// Create an endpoint for the given URL
    ///
    /// # Errors
    ///
    /// Returns [`IceError::Endpoint`] when the HTTP client cannot be
    /// constructed.
    pub fn new(url: impl Into<String>) -> Result<Self, IceError> {
        let client = reqwest::Client::builder()
            .timeout(ENDPOINT_TIMEOUT)
            .build()
            .map_err(|e| IceError::Endpoint(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl IceEndpoint for HttpIceEndpoint {
    async fn fetch(&self) -> Result<Vec<IceServer>, IceError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| IceError::Endpoint(e.to_string()))?
            .error_for_status()
            .map_err(|e| IceError::Endpoint(e.to_string()))?;
        response
            .json::<Vec<IceServer>>()
            .await
            .map_err(|e| IceError::Endpoint(e.to_string()))
    }
}

/// Caching provider of [`RtcConfig`].
///
/// The first call fetches from the endpoint; every later call returns
/// the cached result, fallback included. Share one provider per session
/// to fetch TURN credentials at most once.
pub struct IceConfigProvider {
    endpoint: Option<Arc<dyn IceEndpoint>>,
    cached: OnceCell<RtcConfig>,
}

impl IceConfigProvider {
    /// Provider backed by a credential endpoint
    pub fn new(endpoint: Arc<dyn IceEndpoint>) -> Self {
        Self {
            endpoint: Some(endpoint),
            cached: OnceCell::new(),
        }
    }

    /// Provider that always returns the given configuration
    pub fn fixed(config: RtcConfig) -> Self {
        Self {
            endpoint: None,
            cached: OnceCell::new_with(Some(config)),
        }
    }

    /// Get the ICE configuration, fetching and caching on first use
    pub async fn config(&self) -> RtcConfig {
        self.cached
            .get_or_init(|| async {
                let Some(endpoint) = &self.endpoint else {
                    return RtcConfig::fallback();
                };
                match endpoint.fetch().await {
                    Ok(servers) => {
                        let selected = select_servers(servers);
                        if selected.is_empty() {
                            tracing::warn!("ice endpoint returned no usable servers, using fallback");
                            RtcConfig::fallback()
                        } else {
                            tracing::debug!(servers = selected.len(), "ice configuration fetched");
                            RtcConfig {
                                ice_servers: selected,
                                transport_policy: IceTransportPolicy::All,
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "ice endpoint unavailable, using fallback");
                        RtcConfig::fallback()
                    }
                }
            })
            .await
            .clone()
    }
}

/// Keep at most one STUN and one TURN entry, in response order
fn select_servers(servers: Vec<IceServer>) -> Vec<IceServer> {
    let mut selected = Vec::with_capacity(2);
    if let Some(stun) = servers.iter().find(|s| s.is_stun()) {
        selected.push(stun.clone());
    }
    if let Some(turn) = servers.iter().find(|s| s.is_turn()) {
        selected.push(turn.clone());
    }
    selected
}
