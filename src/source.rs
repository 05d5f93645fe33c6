//! Upstream raw-signal sources and bounded retry.

use std::time::Duration;

use reqwest::Url;
use thiserror::Error;
use tracing::{debug, warn};

use crate::normalize::RawRecord;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SourceError {
    #[error("http client build failed: {0}")]
    HttpClientBuild(String),
    #[error("invalid source url {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("http request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("payload decode failed for {url}: {message}")]
    Decode { url: String, message: String },
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

pub trait UpstreamSource: Send + Sync {
    fn name(&self) -> &str;

    fn fetch(
        &self,
        entity_ids: &[String],
        since_ts_ms_utc: i64,
    ) -> Result<Vec<RawRecord>, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 200,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(10);
        let factor = 1u64 << shift;
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

// Calls `source.fetch` up to `max_retries + 1` times with exponential
// backoff. The last error is returned once attempts are exhausted.
pub fn fetch_with_retry(
    source: &dyn UpstreamSource,
    entity_ids: &[String],
    since_ts_ms_utc: i64,
    policy: &RetryPolicy,
) -> Result<Vec<RawRecord>, SourceError> {
    let mut attempt: u32 = 0;
    loop {
        match source.fetch(entity_ids, since_ts_ms_utc) {
            Ok(records) => {
                debug!(
                    component = "source",
                    event = "source.fetch.ok",
                    source = source.name(),
                    entities = entity_ids.len(),
                    records = records.len(),
                    attempts = attempt + 1
                );
                return Ok(records);
            }
            Err(err) if attempt >= policy.max_retries => return Err(err),
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let sleep = policy.backoff(attempt);
                warn!(
                    component = "source",
                    event = "source.fetch.retry",
                    source = source.name(),
                    attempt,
                    backoff_ms = sleep.as_millis() as u64,
                    error = %err
                );
                std::thread::sleep(sleep);
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticRecordSource {
    records: Vec<RawRecord>,
}

impl StaticRecordSource {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self { records }
    }
}

impl UpstreamSource for StaticRecordSource {
    fn name(&self) -> &str {
        "static"
    }

    fn fetch(
        &self,
        entity_ids: &[String],
        since_ts_ms_utc: i64,
    ) -> Result<Vec<RawRecord>, SourceError> {
        Ok(self
            .records
            .iter()
            .filter(|record| match record.entity_id() {
                Some(id) => entity_ids.iter().any(|wanted| wanted == id),
                None => true,
            })
            .filter(|record| record.observed_since(since_ts_ms_utc))
            .cloned()
            .collect())
    }
}

pub trait HttpFetcher: Send + Sync {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, SourceError>;
}

pub struct ReqwestBlockingFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingFetcher {
    pub fn new(timeout_ms: u64) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| SourceError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestBlockingFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| SourceError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::HttpRequest {
                url: url.to_string(),
                message: format!("unexpected HTTP status {status}"),
            });
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| SourceError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}

pub struct HttpJsonSource {
    base_url: String,
    fetcher: Box<dyn HttpFetcher>,
}

impl HttpJsonSource {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64) -> Result<Self, SourceError> {
        let fetcher = ReqwestBlockingFetcher::new(timeout_ms)?;
        Ok(Self::with_fetcher(base_url, Box::new(fetcher)))
    }

    pub fn with_fetcher(base_url: impl Into<String>, fetcher: Box<dyn HttpFetcher>) -> Self {
        Self {
            base_url: base_url.into(),
            fetcher,
        }
    }

    pub fn request_url(
        &self,
        entity_ids: &[String],
        since_ts_ms_utc: i64,
    ) -> Result<String, SourceError> {
        let params = [
            ("entity_id", entity_ids.join(",")),
            ("since_ts_ms_utc", since_ts_ms_utc.to_string()),
        ];
        Url::parse_with_params(&self.base_url, &params)
            .map(|url| url.to_string())
            .map_err(|err| SourceError::InvalidUrl {
                url: self.base_url.clone(),
                message: err.to_string(),
            })
    }
}

impl UpstreamSource for HttpJsonSource {
    fn name(&self) -> &str {
        "http_json"
    }

    fn fetch(
        &self,
        entity_ids: &[String],
        since_ts_ms_utc: i64,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let url = self.request_url(entity_ids, since_ts_ms_utc)?;
        let payload = self.fetcher.get_bytes(&url)?;
        serde_json::from_slice(&payload).map_err(|err| SourceError::Decode {
            url,
            message: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct MockFetcher {
        responses: HashMap<String, Vec<u8>>,
    }

    impl MockFetcher {
        fn with(mut self, url: &str, body: &[u8]) -> Self {
            self.responses.insert(url.to_string(), body.to_vec());
            self
        }
    }

    impl HttpFetcher for MockFetcher {
        fn get_bytes(&self, url: &str) -> Result<Vec<u8>, SourceError> {
            self.responses
                .get(url)
                .cloned()
                .ok_or_else(|| SourceError::HttpRequest {
                    url: url.to_string(),
                    message: "missing mock response".to_string(),
                })
        }
    }

    struct FlakySource {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    impl UpstreamSource for FlakySource {
        fn name(&self) -> &str {
            "flaky"
        }

        fn fetch(&self, _: &[String], _: i64) -> Result<Vec<RawRecord>, SourceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(SourceError::Unavailable(format!("call {call}")))
            } else {
                Ok(Vec::new())
            }
        }
    }

    #[test]
    fn http_source_decodes_tagged_records() {
        let url = "http://upstream.test/records?entity_id=p1&since_ts_ms_utc=0";
        let body = br#"[{"kind":"flow","entity_id":"p1","ts_ms_utc":60000,"current_speed":20.0,"free_flow_speed":40.0}]"#;
        let source = HttpJsonSource::with_fetcher(
            "http://upstream.test/records",
            Box::new(MockFetcher::default().with(url, body)),
        );

        let records = source.fetch(&["p1".to_string()], 0).expect("fetch");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entity_id(), Some("p1"));
    }

    #[test]
    fn http_source_reports_decode_errors() {
        let url = "http://upstream.test/records?entity_id=p1&since_ts_ms_utc=0";
        let source = HttpJsonSource::with_fetcher(
            "http://upstream.test/records",
            Box::new(MockFetcher::default().with(url, b"not json")),
        );
        assert!(matches!(
            source.fetch(&["p1".to_string()], 0),
            Err(SourceError::Decode { .. })
        ));
    }

    #[test]
    fn retry_succeeds_within_budget() {
        let source = FlakySource {
            failures_before_success: 2,
            calls: AtomicU32::new(0),
        };
        let policy = RetryPolicy {
            max_retries: 2,
            retry_backoff_ms: 0,
        };
        fetch_with_retry(&source, &[], 0, &policy).expect("third attempt succeeds");
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_gives_up_after_max_retries() {
        let source = FlakySource {
            failures_before_success: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let policy = RetryPolicy {
            max_retries: 2,
            retry_backoff_ms: 0,
        };
        let err = fetch_with_retry(&source, &[], 0, &policy).expect_err("exhausted");
        assert_eq!(err, SourceError::Unavailable("call 2".to_string()));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_retries: 5,
            retry_backoff_ms: 100,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
    }
}
