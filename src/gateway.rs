//! Outbound calls to the control-plane: fetching split/segment changes and
//! pushing telemetry bulks.
//!
//! Sync tasks talk to the backend through the [`Gateway`] trait so they can
//! be driven by a scripted fake in tests. [`HttpGateway`] is the production
//! implementation.
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::{StatusCode, Url};

use crate::segments::SegmentChanges;
use crate::splits::SplitChanges;
use crate::telemetry::{Event, Impression};
use crate::{Error, Result};

/// Remote control-plane interface used by the sync and flush tasks.
pub trait Gateway: Send + Sync {
    /// Fetch split changes since the given change number.
    fn fetch_splits(&self, since: i64) -> Result<SplitChanges>;

    /// Fetch membership changes for one segment since the given change
    /// number.
    fn fetch_segment_changes(&self, name: &str, since: i64) -> Result<SegmentChanges>;

    /// Push a bulk of impressions.
    fn post_impressions(&self, batch: &[Impression]) -> Result<()>;

    /// Push a bulk of events.
    fn post_events(&self, batch: &[Event]) -> Result<()>;
}

/// Configuration for [`HttpGateway`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL for the change-fetching endpoints.
    pub base_url: String,
    /// Base URL for the telemetry bulk endpoints.
    pub events_url: String,
    pub api_key: String,
    /// SDK name/version advertised to the backend.
    pub sdk_version: String,
    /// Per-request timeout. Bounded so a stuck backend can never block task
    /// shutdown indefinitely.
    ///
    /// Defaults to [`GatewayConfig::DEFAULT_TIMEOUT`].
    pub timeout: Duration,
}

impl GatewayConfig {
    /// Default value for [`GatewayConfig::timeout`].
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(
        base_url: impl Into<String>,
        events_url: impl Into<String>,
        api_key: impl Into<String>,
        sdk_version: impl Into<String>,
    ) -> GatewayConfig {
        GatewayConfig {
            base_url: base_url.into(),
            events_url: events_url.into(),
            api_key: api_key.into(),
            sdk_version: sdk_version.into(),
            timeout: GatewayConfig::DEFAULT_TIMEOUT,
        }
    }

    /// Update request timeout with `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> GatewayConfig {
        self.timeout = timeout;
        self
    }
}

const SPLIT_CHANGES_ENDPOINT: &str = "/splitChanges";
const SEGMENT_CHANGES_ENDPOINT: &str = "/segmentChanges";
const IMPRESSIONS_ENDPOINT: &str = "/testImpressions/bulk";
const EVENTS_ENDPOINT: &str = "/events/bulk";

/// HTTP client for the control-plane endpoints.
pub struct HttpGateway {
    // Client holds a connection pool internally, so we're reusing the client
    // between requests.
    client: reqwest::blocking::Client,
    config: GatewayConfig,
    /// If we receive a 401 Unauthorized error during a request, it means the
    /// API key is not valid. We cache this error so we don't issue additional
    /// requests to the server.
    unauthorized: AtomicBool,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> Result<HttpGateway> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(HttpGateway {
            client,
            config,
            unauthorized: AtomicBool::new(false),
        })
    }

    fn changes_url(&self, endpoint: &str, since: i64) -> Result<Url> {
        Url::parse_with_params(
            &format!("{}{}", self.config.base_url, endpoint),
            &[("since", since.to_string())],
        )
        .map_err(Error::InvalidBaseUrl)
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T> {
        if self.unauthorized.load(Ordering::Acquire) {
            return Err(Error::Unauthorized);
        }

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.config.api_key)
            .header("SplitSDKVersion", &self.config.sdk_version)
            .send()?;
        let response = self.check_status(response)?;

        Ok(response.json()?)
    }

    fn post_json<T: serde::Serialize>(&self, endpoint: &str, body: &T) -> Result<()> {
        if self.unauthorized.load(Ordering::Acquire) {
            return Err(Error::Unauthorized);
        }

        let url = Url::parse(&format!("{}{}", self.config.events_url, endpoint))
            .map_err(Error::InvalidBaseUrl)?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .header("SplitSDKVersion", &self.config.sdk_version)
            .json(body)
            .send()?;
        self.check_status(response)?;

        Ok(())
    }

    fn check_status(
        &self,
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response> {
        response.error_for_status().map_err(|err| {
            if err.status() == Some(StatusCode::UNAUTHORIZED) {
                log::warn!(target: "flagsync", "client is not authorized. Check your API key");
                self.unauthorized.store(true, Ordering::Release);
                Error::Unauthorized
            } else {
                log::warn!(target: "flagsync", "received non-200 response: {:?}", err);
                Error::from(err)
            }
        })
    }
}


impl Gateway for HttpGateway {
    fn fetch_splits(&self, since: i64) -> Result<SplitChanges> {
        log::debug!(target: "flagsync", since; "fetching split changes");
        let url = self.changes_url(SPLIT_CHANGES_ENDPOINT, since)?;
        self.get_json(url)
    }

    fn fetch_segment_changes(&self, name: &str, since: i64) -> Result<SegmentChanges> {
        log::debug!(target: "flagsync", segment = name, since; "fetching segment changes");
        let url = Url::parse_with_params(
            &format!(
                "{}{}/{}",
                self.config.base_url, SEGMENT_CHANGES_ENDPOINT, name
            ),
            &[("since", since.to_string())],
        )
        .map_err(Error::InvalidBaseUrl)?;
        self.get_json(url)
    }

    fn post_impressions(&self, batch: &[Impression]) -> Result<()> {
        log::debug!(target: "flagsync", count = batch.len(); "posting impressions bulk");
        self.post_json(IMPRESSIONS_ENDPOINT, &batch)
    }

    fn post_events(&self, batch: &[Event]) -> Result<()> {
        log::debug!(target: "flagsync", count = batch.len(); "posting events bulk");
        self.post_json(EVENTS_ENDPOINT, &batch)
    }
}
