//! CoinGecko price provider.
//!
//! Prices come from `GET /simple/price?vs_currencies=usd&ids=<a,b,...>`.
//! Large id lists are split so every request URL stays within the
//! provider's maximum length, and each batch costs one unit of quota.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::client::ApiClient;
use super::{ApiProvider, ProviderContext};
use crate::batch::{BatchFetchOrchestrator, FetchReport, ProgressFn, RequestChunker};
use crate::config::CoingeckoConfig;
use crate::error::{RatekeeperError, Result};
use crate::ratelimit::RateLimiter;

pub const PROVIDER_NAME: &str = "coingecko";
const GET_PRICES: &str = "get_prices";
const PRICE_ENDPOINT: &str = "simple/price";
const API_KEY_HEADER: &str = "x-cg-demo-api-key";

#[derive(Debug, Deserialize)]
struct GetPricesParams {
    ids: Vec<String>,
}

pub struct CoingeckoProvider {
    client: ApiClient,
    settings: CoingeckoConfig,
    acquire_timeout: Duration,
    progress: Option<ProgressFn>,
}

impl CoingeckoProvider {
    /// Build the provider and its limiter from a registry context.
    ///
    /// The stored service record may override the base URL, API key and
    /// timeout; an inactive record refuses to start.
    pub async fn connect(context: ProviderContext) -> Result<Self> {
        let record = context
            .backends
            .config
            .load_service(PROVIDER_NAME)
            .await?
            .ok_or_else(|| RatekeeperError::ConfigNotFound(PROVIDER_NAME.to_string()))?;
        if !record.is_active {
            return Err(RatekeeperError::Config(format!(
                "API provider {} is disabled",
                PROVIDER_NAME
            )));
        }

        let mut settings = context.settings.providers.coingecko.clone();
        if let Some(base_url) = &record.base_url {
            settings.base_url = base_url.clone();
        }
        if let Some(timeout_secs) = record.timeout_secs {
            settings.timeout_secs = timeout_secs;
        }

        let limiter = RateLimiter::new(
            PROVIDER_NAME,
            context.backends.clone(),
            context.limiter_options(),
        )
        .await?;

        Self::new(
            Arc::new(limiter),
            &context,
            settings,
            record.api_key.as_deref(),
        )
    }

    pub fn new(
        limiter: Arc<RateLimiter>,
        context: &ProviderContext,
        settings: CoingeckoConfig,
        api_key: Option<&str>,
    ) -> Result<Self> {
        let acquire_timeout = context.settings.rate_limiting.acquire_timeout();
        let mut client = ApiClient::new(
            settings.base_url.clone(),
            limiter,
            &context.backends,
            settings.timeout(),
            acquire_timeout,
        )?;
        if let Some(key) = api_key {
            client = client.with_api_key(API_KEY_HEADER, key)?;
        }

        Ok(Self {
            client,
            settings,
            acquire_timeout,
            progress: None,
        })
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// The URL every price request starts with; counts against the limit.
    pub fn price_url_prefix(&self) -> String {
        format!(
            "{}/{}?vs_currencies=usd&ids=",
            self.client.base_url(),
            PRICE_ENDPOINT
        )
    }

    /// Fetch USD prices, keyed by the prefixed ticker id.
    ///
    /// Ids the provider returns without a `usd` value are left out.
    pub async fn get_prices(&self, ids: &[String]) -> FetchReport<f64> {
        let chunker = RequestChunker::new(self.settings.max_url_length, &self.price_url_prefix());
        let mut orchestrator = BatchFetchOrchestrator::new(self.client.limiter().clone(), chunker)
            .with_acquire_timeout(self.acquire_timeout);
        if let Some(progress) = &self.progress {
            orchestrator = orchestrator.with_progress(progress.clone());
        }

        let client = &self.client;
        let mut report = orchestrator
            .fetch(ids, |batch| async move {
                let joined = batch.join(",");
                let body = client
                    .send_admitted(
                        Method::GET,
                        PRICE_ENDPOINT,
                        &[("vs_currencies", "usd"), ("ids", joined.as_str())],
                    )
                    .await?;
                parse_prices(body)
            })
            .await;

        report.results = std::mem::take(&mut report.results)
            .into_iter()
            .map(|(id, price)| (format!("{}{}", self.settings.price_prefix, id), price))
            .collect();

        info!(
            requested = report.requested,
            received = report.received,
            failures = report.failures.len(),
            "CoinGecko price fetch finished"
        );
        report
    }
}

/// `{"bitcoin": {"usd": 1.0}, ...}` to `{"bitcoin": 1.0}`.
fn parse_prices(body: Value) -> Result<BTreeMap<String, f64>> {
    let quotes: BTreeMap<String, BTreeMap<String, Value>> = serde_json::from_value(body)?;
    Ok(quotes
        .into_iter()
        .filter_map(|(id, quote)| quote.get("usd").and_then(Value::as_f64).map(|usd| (id, usd)))
        .collect())
}

#[async_trait]
impl ApiProvider for CoingeckoProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn methods(&self) -> &[&'static str] {
        &[GET_PRICES]
    }

    async fn acquire_quota(&self, timeout: Option<Duration>) -> bool {
        self.client.limiter().acquire(timeout).await
    }

    async fn execute(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            GET_PRICES => {
                let params: GetPricesParams = serde_json::from_value(params)?;
                let report = self.get_prices(&params.ids).await;
                Ok(json!({
                    "prices": report.results,
                    "report": {
                        "requested": report.requested,
                        "received": report.received,
                        "total_batches": report.total_batches,
                        "failures": report.failures,
                    },
                }))
            }
            other => Err(RatekeeperError::UnknownMethod {
                provider: PROVIDER_NAME.to_string(),
                method: other.to_string(),
            }),
        }
    }

    async fn save_state(&self) {
        self.client.save_state().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::testing::{at, memory_backends, service, TestBackends};
    use crate::clock::Clock;
    use crate::config::RatekeeperConfig;
    use crate::provider::testing::http_stub;

    /// Answers every id except `delisted` with its length as the price.
    fn price_responder(target: &str, _head: &str) -> (u16, String) {
        let ids = target.split("ids=").nth(1).unwrap_or("");
        if ids.contains("broken") {
            return (500, "upstream error".to_string());
        }
        let quotes: serde_json::Map<String, Value> = ids
            .split(',')
            .filter(|id| !id.is_empty())
            .map(|id| {
                let quote = if id == "delisted" {
                    json!({})
                } else {
                    json!({ "usd": id.len() as f64 })
                };
                (id.to_string(), quote)
            })
            .collect();
        (200, Value::Object(quotes).to_string())
    }

    async fn provider(
        test: &TestBackends,
        base_url: String,
        max_url_length: usize,
    ) -> CoingeckoProvider {
        test.config
            .insert(service(PROVIDER_NAME, [100, 0, 0, 0], Some(test.clock.now())));
        let mut settings = RatekeeperConfig::default();
        settings.rate_limiting.sync_interval = 0;
        settings.rate_limiting.acquire_timeout_secs = 0;
        settings.providers.coingecko.base_url = base_url;
        settings.providers.coingecko.max_url_length = max_url_length;

        CoingeckoProvider::connect(ProviderContext::new(test.backends.clone(), settings))
            .await
            .unwrap()
    }

    fn price_prefix(base: &str) -> String {
        format!("{}/simple/price?vs_currencies=usd&ids=", base)
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[tokio::test]
    async fn test_prices_are_prefixed_and_missing_usd_skipped() {
        let base = http_stub(price_responder).await;
        let test = memory_backends(at(2024, 6, 1, 12, 0, 0));
        let coingecko = provider(&test, base, 2048).await;

        let report = coingecko
            .get_prices(&ids(&["bitcoin", "delisted", "eth"]))
            .await;

        assert_eq!(report.requested, 3);
        assert_eq!(report.received, 2);
        assert_eq!(report.total_batches, 1);
        assert_eq!(report.results.get("crypto:bitcoin"), Some(&7.0));
        assert_eq!(report.results.get("crypto:eth"), Some(&3.0));
        assert!(!report.results.contains_key("crypto:delisted"));
    }

    #[tokio::test]
    async fn test_long_lists_are_split_and_each_batch_costs_quota() {
        let base = http_stub(price_responder).await;
        let test = memory_backends(at(2024, 6, 1, 12, 0, 0));
        let max = price_prefix(&base).len() + 12;
        let coingecko = provider(&test, base.clone(), max).await;

        // "coinN," costs 6, so two ids fit per batch.
        let names: Vec<String> = (1..=5).map(|i| format!("coin{}", i)).collect();
        let report = coingecko.get_prices(&names).await;

        assert_eq!(coingecko.price_url_prefix(), price_prefix(&base));
        assert_eq!(report.total_batches, 3);
        assert_eq!(report.received, 5);
        assert_eq!(coingecko.client.limiter().total_requests().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_stop_the_rest() {
        let base = http_stub(price_responder).await;
        let test = memory_backends(at(2024, 6, 1, 12, 0, 0));
        let max = price_prefix(&base).len() + 12;
        let coingecko = provider(&test, base, max).await;

        let report = coingecko
            .get_prices(&ids(&["alpha", "beta", "broken", "gamma"]))
            .await;

        assert_eq!(report.total_batches, 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].batch_index, 2);
        assert_eq!(report.failures[0].ids, ids(&["broken"]));
        assert!(report.failures[0].error.contains("500"));
        assert_eq!(report.received, 3);
    }

    #[tokio::test]
    async fn test_execute_get_prices_and_unknown_method() {
        let base = http_stub(price_responder).await;
        let test = memory_backends(at(2024, 6, 1, 12, 0, 0));
        let coingecko = provider(&test, base, 2048).await;

        let output = coingecko
            .execute(GET_PRICES, json!({ "ids": ["sol"] }))
            .await
            .unwrap();
        assert_eq!(output["prices"]["crypto:sol"], json!(3.0));
        assert_eq!(output["report"]["received"], json!(1));
        assert_eq!(output["report"]["failures"], json!([]));

        let unknown = coingecko.execute("get_history", json!({})).await;
        assert!(matches!(unknown, Err(RatekeeperError::UnknownMethod { .. })));

        let bad_params = coingecko.execute(GET_PRICES, json!({ "ids": 5 })).await;
        assert!(matches!(bad_params, Err(RatekeeperError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_save_state_flushes_logs_and_counters() {
        let base = http_stub(price_responder).await;
        let test = memory_backends(at(2024, 6, 1, 12, 0, 0));
        let coingecko = provider(&test, base, 2048).await;

        coingecko.get_prices(&ids(&["bitcoin"])).await;
        coingecko.save_state().await;

        let logs = test.config.request_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].endpoint, PRICE_ENDPOINT);
        assert_eq!(logs[0].parameters["ids"], "bitcoin");
        assert_eq!(test.config.service(PROVIDER_NAME).unwrap().minute_counter, 1);
    }

    #[tokio::test]
    async fn test_service_record_overrides_url_and_sends_api_key() {
        let base = http_stub(|target, head| {
            if head.to_ascii_lowercase().contains("x-cg-demo-api-key: secret") {
                price_responder(target, head)
            } else {
                (401, "missing key".to_string())
            }
        })
        .await;
        let test = memory_backends(at(2024, 6, 1, 12, 0, 0));
        let mut record = service(PROVIDER_NAME, [100, 0, 0, 0], Some(test.clock.now()));
        record.base_url = Some(base.clone());
        record.api_key = Some("secret".to_string());
        test.config.insert(record);

        let mut settings = RatekeeperConfig::default();
        settings.rate_limiting.sync_interval = 0;
        settings.providers.coingecko.base_url = "http://127.0.0.1:9".to_string();
        let coingecko = CoingeckoProvider::connect(ProviderContext::new(test.backends.clone(), settings))
            .await
            .unwrap();

        assert_eq!(coingecko.price_url_prefix(), price_prefix(&base));
        let report = coingecko.get_prices(&ids(&["bitcoin"])).await;
        assert!(report.is_complete());
        assert_eq!(report.results.get("crypto:bitcoin"), Some(&7.0));
    }

    #[tokio::test]
    async fn test_inactive_service_refuses_to_start() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 0));
        let mut record = service(PROVIDER_NAME, [100, 0, 0, 0], None);
        record.is_active = false;
        test.config.insert(record);

        let context = ProviderContext::new(test.backends.clone(), RatekeeperConfig::default());
        let result = CoingeckoProvider::connect(context).await;
        assert!(matches!(result, Err(RatekeeperError::Config(_))));
    }

    #[test]
    fn test_parse_prices_rejects_unexpected_shape() {
        assert!(parse_prices(json!(["bitcoin"])).is_err());
        let parsed = parse_prices(json!({ "btc": { "usd": 2.5, "eur": 2.0 } })).unwrap();
        assert_eq!(parsed, BTreeMap::from([("btc".to_string(), 2.5)]));
    }
}
