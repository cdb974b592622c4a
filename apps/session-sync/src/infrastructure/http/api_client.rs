//! JSON API client for media server REST endpoints.
//!
//! Every request goes through the [`RateLimitedExecutor`], carries the
//! server's authentication headers and is cancelled by the shutdown token.

use std::time::Duration;

use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use super::rate_limit::{RateLimitConfig, RateLimitedExecutor};
use crate::application::ports::SourceError;

/// Longest error body kept in [`SourceError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// Transport settings shared by every media server client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpSettings {
    /// Per-request timeout.
    pub timeout: Duration,
    /// 429 retry settings.
    pub rate_limit: RateLimitConfig,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Authenticated JSON client bound to one server.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
    headers: HeaderMap,
    executor: RateLimitedExecutor,
    cancel: CancellationToken,
}

impl ApiClient {
    /// Build a client for `base_url` sending `headers` on every request.
    pub fn new(
        base_url: &str,
        headers: &[(&'static str, String)],
        settings: HttpSettings,
        cancel: CancellationToken,
    ) -> Result<Self, SourceError> {
        let base_url = Url::parse(base_url).map_err(|e| SourceError::InvalidUrl {
            message: format!("{base_url}: {e}"),
        })?;

        let mut header_map = HeaderMap::new();
        header_map.insert(ACCEPT, HeaderValue::from_static("application/json"));
        for (name, value) in headers {
            let invalid = |e: &dyn std::fmt::Display| SourceError::InvalidUrl {
                message: format!("invalid {name} header: {e}"),
            };
            let header = HeaderName::try_from(*name).map_err(|e| invalid(&e))?;
            let value = HeaderValue::from_str(value).map_err(|e| invalid(&e))?;
            header_map.insert(header, value);
        }

        let http = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| SourceError::Transport {
                message: e.to_string(),
            })?;

        Ok(Self {
            http,
            base_url,
            headers: header_map,
            executor: RateLimitedExecutor::new(settings.rate_limit),
            cancel,
        })
    }

    /// Server base URL.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `GET path` and require a 2xx response.
    pub async fn get_ok(&self, path: &str) -> Result<(), SourceError> {
        self.get(path).await.map(drop)
    }

    /// `GET path` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SourceError> {
        let response = self.get(path).await?;
        response.json().await.map_err(|e| SourceError::Decode {
            message: e.to_string(),
        })
    }

    /// `path` is appended to the base URL's own path, so servers behind a
    /// reverse-proxy prefix work.
    async fn get(&self, path: &str) -> Result<Response, SourceError> {
        let mut url = self.base_url.clone();
        url.set_path(&format!(
            "{}{path}",
            self.base_url.path().trim_end_matches('/')
        ));
        let request = self.http.get(url).headers(self.headers.clone());

        let response = self.executor.send(&self.cancel, request).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let cut = (0..=MAX_ERROR_BODY)
                .rev()
                .find(|i| body.is_char_boundary(*i))
                .unwrap_or(0);
            body.truncate(cut);
        }
        Err(SourceError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_base_url() {
        let err = ApiClient::new("not a url", &[], HttpSettings::default(), CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, SourceError::InvalidUrl { .. }));
    }

    #[test]
    fn test_rejects_invalid_header_value() {
        let err = ApiClient::new(
            "http://localhost:8096",
            &[("x-emby-token", "bad\nvalue".to_string())],
            HttpSettings::default(),
            CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, SourceError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_non_success_becomes_status_error() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/emby/Sessions"))
            .and(header("x-emby-token", "secret"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .mount(&server)
            .await;

        let client = ApiClient::new(
            &format!("{}/emby", server.uri()),
            &[("x-emby-token", "secret".to_string())],
            HttpSettings::default(),
            CancellationToken::new(),
        )
        .unwrap();
        let err = client.get_ok("/Sessions").await.unwrap_err();
        assert_eq!(
            err,
            SourceError::Status {
                status: 401,
                body: "bad token".to_string()
            }
        );
    }

    #[test]
    fn test_default_settings() {
        let settings = HttpSettings::default();
        assert_eq!(settings.timeout, Duration::from_secs(30));
        assert_eq!(settings.rate_limit, RateLimitConfig::default());
    }
}
