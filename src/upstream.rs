use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::accounts::AccountCredentials;
use crate::config::ServerConfig;
use crate::error::GatewayError;
use crate::protocol::openai::ChatRequest;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PROXY_CLIENT_CACHE_MAX_ENTRIES: usize = 64;

/// A complete (non-streaming) upstream reply.
#[derive(Debug)]
pub struct UpstreamReply {
    pub status: u16,
    pub headers: http::HeaderMap,
    pub body: bytes::Bytes,
}

/// HTTP client for upstream `chat/completions` calls.
///
/// Clients are built lazily: one shared default client plus one per proxy
/// URL, cached behind a lock.
pub struct UpstreamClient {
    default_client: OnceLock<reqwest::Client>,
    proxy_clients: RwLock<FxHashMap<String, reqwest::Client>>,
    timeout: Duration,
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
    user_agent: String,
}

impl UpstreamClient {
    #[must_use]
    pub fn new(config: &ServerConfig) -> Self {
        let pool_idle_timeout = if config.http_pool_idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(config.http_pool_idle_timeout_secs))
        };
        Self {
            default_client: OnceLock::new(),
            proxy_clients: RwLock::new(FxHashMap::default()),
            timeout: Duration::from_secs(config.upstream_timeout_secs),
            pool_max_idle_per_host: config.http_pool_max_idle_per_host.max(1),
            pool_idle_timeout,
            user_agent: config.user_agent.clone(),
        }
    }

    fn build_client(&self, proxy_url: Option<&str>) -> Result<reqwest::Client, GatewayError> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .pool_idle_timeout(self.pool_idle_timeout)
            .tcp_nodelay(true)
            .connect_timeout(CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(self.timeout)
            .no_proxy();
        if let Some(proxy_url) = proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|err| GatewayError::Transport(format!("Invalid proxy URL: {err}")))?;
            builder = builder.proxy(proxy);
        }
        builder
            .build()
            .map_err(|err| GatewayError::Transport(format!("Failed to build HTTP client: {err}")))
    }

    fn client_for(&self, proxy_url: Option<&str>) -> Result<reqwest::Client, GatewayError> {
        let Some(proxy_url) = proxy_url else {
            if let Some(existing) = self.default_client.get() {
                return Ok(existing.clone());
            }
            let built = self.build_client(None)?;
            let _ = self.default_client.set(built.clone());
            return Ok(built);
        };

        if let Some(existing) = self.proxy_clients.read().get(proxy_url) {
            return Ok(existing.clone());
        }
        let built = self.build_client(Some(proxy_url))?;
        let mut cache = self.proxy_clients.write();
        if let Some(existing) = cache.get(proxy_url) {
            return Ok(existing.clone());
        }
        if cache.len() >= PROXY_CLIENT_CACHE_MAX_ENTRIES {
            cache.clear();
        }
        cache.insert(proxy_url.to_string(), built.clone());
        Ok(built)
    }

    fn completions_url(base_api: &str) -> String {
        format!("{}/chat/completions", base_api.trim_end_matches('/'))
    }

    async fn execute(
        &self,
        credentials: &AccountCredentials,
        body: &ChatRequest,
    ) -> Result<reqwest::Response, GatewayError> {
        let client = self.client_for(credentials.proxy.as_deref())?;
        let user_agent = credentials.user_agent.as_deref().unwrap_or(&self.user_agent);
        client
            .post(Self::completions_url(&credentials.base_api))
            .bearer_auth(&credentials.api_key)
            .header(reqwest::header::USER_AGENT, user_agent)
            .json(body)
            .send()
            .await
            .map_err(|err| GatewayError::Transport(err.to_string()))
    }

    /// Issue one non-streaming request and read the complete reply.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] on connection, proxy, or body-read
    /// failures. Upstream HTTP error statuses are returned as a normal
    /// [`UpstreamReply`] for the caller to map.
    pub async fn send(
        &self,
        credentials: &AccountCredentials,
        body: &ChatRequest,
    ) -> Result<UpstreamReply, GatewayError> {
        let response = self.execute(credentials, body).await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|err| GatewayError::Transport(format!("Failed to read upstream body: {err}")))?;
        Ok(UpstreamReply {
            status,
            headers,
            body,
        })
    }

    /// Open a streaming request. The caller owns status handling and reads
    /// the body as a byte stream; dropping the response tears the upstream
    /// connection down.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] when the request cannot be sent.
    pub async fn open_stream(
        &self,
        credentials: &AccountCredentials,
        body: &ChatRequest,
    ) -> Result<reqwest::Response, GatewayError> {
        self.execute(credentials, body).await
    }
}
