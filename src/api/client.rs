use crate::config::BackendConfig;
use crate::error::{CallError, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartSessionRequest<'a> {
    agent_id: &'a str,
}

/// What the backend hands out for a new test call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGrant {
    pub session_id: String,
    /// Transport endpoint, absolute or relative to the API host
    pub ws_url: String,
    /// Allowed call length in seconds
    #[serde(default)]
    pub max_duration: Option<u64>,
}

/// Backend session lifecycle calls
#[async_trait::async_trait]
pub trait SessionApi: Send + Sync {
    async fn start_session(&self, agent_id: &str) -> Result<SessionGrant>;

    /// Record a deliberate end; must complete before the transport closes
    async fn end_session(&self, session_id: &str) -> Result<()>;

    /// Base URL used to resolve relative transport endpoints
    fn base_url(&self) -> &str;
}

/// REST client for the console backend
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: Url,
    /// Path segments of the session resource below `base_url`
    sessions_path: Vec<String>,
    auth_token: Option<String>,
}

impl BackendClient {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let base_url = Url::parse(config.base_url.trim()).map_err(|e| {
            CallError::Config(format!("Invalid backend base URL {}: {}", config.base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(CallError::Config(format!(
                "Backend base URL {} cannot carry a path",
                base_url
            )));
        }

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| CallError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            sessions_path: config
                .sessions_path
                .split('/')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
            auth_token: config.auth_token.clone().filter(|t| !t.is_empty()),
        })
    }

    /// `{base}/{sessions_path}` followed by `extra` segments, each percent-encoded
    fn sessions_url(&self, extra: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CallError::Config(format!("Backend base URL {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(&self.sessions_path)
            .extend(extra);
        Ok(url)
    }

    fn session_end_url(&self, session_id: &str) -> Result<Url> {
        self.sessions_url(&[session_id, "end"])
    }

    fn post(&self, url: Url) -> reqwest::RequestBuilder {
        let request = self.http.post(url);
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait::async_trait]
impl SessionApi for BackendClient {
    async fn start_session(&self, agent_id: &str) -> Result<SessionGrant> {
        let url = self.sessions_url(&[])?;
        info!("Starting test-call session for agent {}", agent_id);

        let response = self
            .post(url.clone())
            .json(&StartSessionRequest { agent_id })
            .send()
            .await
            .map_err(|e| CallError::SessionRequest(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::SessionRequest(format!(
                "POST {} returned {}: {}",
                url,
                status,
                body.trim()
            )));
        }

        let grant: SessionGrant = response
            .json()
            .await
            .map_err(|e| CallError::SessionRequest(format!("Invalid session response: {}", e)))?;

        info!("Session {} granted", grant.session_id);
        Ok(grant)
    }

    async fn end_session(&self, session_id: &str) -> Result<()> {
        let url = self.session_end_url(session_id)?;

        let response = self
            .post(url.clone())
            .send()
            .await
            .map_err(|e| CallError::SessionRequest(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CallError::SessionRequest(format!(
                "POST {} returned {}",
                url, status
            )));
        }

        info!("Session {} end recorded", session_id);
        Ok(())
    }

    fn base_url(&self) -> &str {
        self.base_url.as_str()
    }
}

/// Resolve the transport endpoint of a grant.
///
/// The endpoint is a URL reference resolved against `base_url`, so absolute
/// URLs, scheme-relative `//host/path` and plain paths all work. `http(s)`
/// results switch to the matching `ws(s)` scheme.
pub fn resolve_ws_url(base_url: &str, ws_url: &str) -> Result<String> {
    let base = Url::parse(base_url)
        .map_err(|e| CallError::Config(format!("Invalid backend base URL {}: {}", base_url, e)))?;
    let mut url = base.join(ws_url.trim()).map_err(|e| {
        CallError::SessionRequest(format!("Invalid transport endpoint {}: {}", ws_url, e))
    })?;

    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url.into()),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(CallError::SessionRequest(format!(
                "Unsupported transport scheme {} in {}",
                other, ws_url
            )))
        }
    };
    url.set_scheme(scheme).map_err(|_| {
        CallError::SessionRequest(format!("Cannot switch {} to {}", url, scheme))
    })?;
    Ok(url.into())
}
