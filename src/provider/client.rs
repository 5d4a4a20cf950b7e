//! Rate-limited HTTP client with request logging.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::{Client, Method};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::backends::Backends;
use crate::clock::Clock;
use crate::error::{RatekeeperError, Result};
use crate::persistence::{ConfigStore, RequestLog};
use crate::ratelimit::RateLimiter;

pub const USER_AGENT: &str = concat!("ratekeeper/", env!("CARGO_PKG_VERSION"));

/// HTTP client for one provider.
///
/// Every request, successful or not, is buffered as a [`RequestLog`] until
/// [`ApiClient::save_state`] flushes it to the config store.
pub struct ApiClient {
    service_name: String,
    base_url: String,
    http: Client,
    /// Credential header added to every request
    api_key: Option<(HeaderName, HeaderValue)>,
    limiter: Arc<RateLimiter>,
    acquire_timeout: Duration,
    logs: Mutex<Vec<RequestLog>>,
    config_store: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        limiter: Arc<RateLimiter>,
        backends: &Backends,
        request_timeout: Duration,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = Client::builder()
            .timeout(request_timeout)
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            service_name: limiter.resource().to_string(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            api_key: None,
            limiter,
            acquire_timeout,
            logs: Mutex::new(Vec::new()),
            config_store: backends.config.clone(),
            clock: backends.clock.clone(),
        })
    }

    /// Send `key` in the `header` header with every request.
    pub fn with_api_key(mut self, header: &'static str, key: &str) -> Result<Self> {
        let mut value = HeaderValue::from_str(key)
            .map_err(|e| RatekeeperError::Config(format!("Invalid API key: {}", e)))?;
        value.set_sensitive(true);
        self.api_key = Some((HeaderName::from_static(header), value));
        Ok(self)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Number of request logs waiting to be flushed.
    pub fn pending_logs(&self) -> usize {
        self.logs.lock().len()
    }

    /// Send a request after taking one unit of quota.
    ///
    /// Fails with `QuotaTimeout` when the quota is not granted in time.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<Value> {
        self.limiter
            .limit_scope(self.acquire_timeout, self.send_admitted(method, endpoint, params))
            .await?
    }

    /// Send a request whose quota the caller has already taken.
    pub async fn send_admitted(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));
        debug!(service = %self.service_name, url = %url, "Sending request");

        let mut request = self.http.request(method.clone(), &url).query(params);
        if let Some((header, value)) = &self.api_key {
            request = request.header(header.clone(), value.clone());
        }

        let started = Instant::now();
        let sent = request.send().await;
        let elapsed = started.elapsed();

        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                self.record(&method, endpoint, params, None, elapsed, Some(e.to_string()));
                error!(service = %self.service_name, url = %url, error = %e, "Request failed");
                return Err(e.into());
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.record(&method, endpoint, params, Some(status.as_u16()), elapsed, Some(body.clone()));
            error!(
                service = %self.service_name,
                status = status.as_u16(),
                body = %body,
                "API request failed"
            );
            return Err(RatekeeperError::HttpStatus {
                status: status.as_u16(),
                url,
                body,
            });
        }

        match response.json::<Value>().await {
            Ok(body) => {
                self.record(&method, endpoint, params, Some(status.as_u16()), elapsed, None);
                Ok(body)
            }
            Err(e) => {
                let message = format!("Invalid JSON body: {}", e);
                self.record(&method, endpoint, params, Some(status.as_u16()), elapsed, Some(message));
                error!(service = %self.service_name, url = %url, error = %e, "Undecodable response body");
                Err(e.into())
            }
        }
    }

    fn record(
        &self,
        method: &Method,
        endpoint: &str,
        params: &[(&str, &str)],
        status_code: Option<u16>,
        elapsed: Duration,
        error_message: Option<String>,
    ) {
        let log = RequestLog {
            service_name: self.service_name.clone(),
            endpoint: endpoint.to_string(),
            method: method.as_str().to_string(),
            status_code,
            response_time_secs: elapsed.as_secs_f64(),
            was_successful: error_message.is_none(),
            error_message,
            parameters: params
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect::<BTreeMap<_, _>>(),
            created_at: self.clock.now(),
        };
        self.logs.lock().push(log);
    }

    /// Flush request logs, then sync the limiter's counters.
    ///
    /// Logs that fail to persist are kept for the next attempt.
    pub async fn save_state(&self) {
        let pending = std::mem::take(&mut *self.logs.lock());
        if !pending.is_empty() {
            match self.config_store.append_request_logs(&pending).await {
                Ok(()) => info!(service = %self.service_name, count = pending.len(), "Saved request logs"),
                Err(e) => {
                    error!(service = %self.service_name, error = %e, "Failed to save request logs");
                    let mut logs = self.logs.lock();
                    let newer = std::mem::replace(&mut *logs, pending);
                    logs.extend(newer);
                }
            }
        }

        self.limiter.save_state().await;
    }
}
