//! §4.A HTTP transport: authenticated JSON request/response with schema
//! validation and typed error surfacing. The only retry at this layer is the
//! single forced-refresh-and-retry on `401` described in §4.B/§7; backoff
//! retries for `429`/`5xx` are the Colab API client's job (§4.B/§7).

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::access_token::AccessTokenSource;
use crate::error::{Result, RuntimeError};

/// Default per-request timeout (spec §5: "HTTP: 30s default per request").
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Authenticated JSON/multipart transport, grounded on `analytics.rs`'s
/// `reqwest::ClientBuilder` construction and `ananis25-jute`'s
/// `Authorization` header + `error_for_status` pattern.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    token_source: Arc<dyn AccessTokenSource>,
}

impl HttpTransport {
    pub fn new(token_source: Arc<dyn AccessTokenSource>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()?;
        Ok(HttpTransport { client, token_source })
    }

    /// Issue a request and parse the JSON body as `T`. `204` and `DELETE`
    /// return `()`; callers that expect no body should use `request_unit`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&(impl Serialize + Sync)>,
    ) -> Result<T> {
        let text = self.request_text(method, url, body).await?;
        serde_json::from_str(&text).map_err(|e| RuntimeError::SchemaError {
            message: e.to_string(),
            body: text,
        })
    }

    /// Issue a request expecting no meaningful response body (`204`, or a
    /// `DELETE`).
    pub async fn request_unit(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&(impl Serialize + Sync)>,
    ) -> Result<()> {
        self.request_text(method, url, body).await.map(|_| ())
    }

    /// Sends the request once with `force_refresh`, returning the raw status
    /// and drained body text so the caller can decide whether to retry.
    async fn try_once(
        &self,
        method: &reqwest::Method,
        url: &str,
        body: Option<&(impl Serialize + Sync)>,
        force_refresh: bool,
    ) -> Result<(reqwest::StatusCode, String)> {
        let token = self.token_source.get(force_refresh).await?;

        let mut builder = self
            .client
            .request(method.clone(), url)
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {token}"));
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        Ok((status, text))
    }

    /// On a `401` this refreshes the token once and retries the same request
    /// before giving up, per §4.B/§7: "recoverable by one token refresh then
    /// retry."
    async fn request_text(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&(impl Serialize + Sync)>,
    ) -> Result<String> {
        let is_delete = method == reqwest::Method::DELETE;

        let (mut status, mut body_text) = self.try_once(&method, url, body, false).await?;
        if status == reqwest::StatusCode::UNAUTHORIZED {
            let (retry_status, retry_text) = self.try_once(&method, url, body, true).await?;
            status = retry_status;
            body_text = retry_text;
        }

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RuntimeError::Unauthenticated);
        }
        if status == reqwest::StatusCode::NO_CONTENT || is_delete {
            return Ok(String::new());
        }
        if !status.is_success() {
            let status_text = status
                .canonical_reason()
                .unwrap_or("unknown status")
                .to_string();
            return Err(RuntimeError::HttpError {
                status: status.as_u16(),
                status_text,
                body_text,
            });
        }

        Ok(body_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedToken;

    #[async_trait]
    impl AccessTokenSource for FixedToken {
        async fn get(&self, _force_refresh: bool) -> Result<String> {
            Ok("tok".to_string())
        }
    }

    #[test]
    fn transport_builds_with_default_timeout() {
        let transport = HttpTransport::new(Arc::new(FixedToken));
        assert!(transport.is_ok());
    }

    #[tokio::test]
    async fn retries_once_with_forced_refresh_after_401() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/thing"))
            .and(header("authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/thing"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_string("\"ok\""))
            .mount(&server)
            .await;

        struct RefreshingToken;
        #[async_trait]
        impl AccessTokenSource for RefreshingToken {
            async fn get(&self, force_refresh: bool) -> Result<String> {
                Ok(if force_refresh { "fresh" } else { "stale" }.to_string())
            }
        }

        let transport = HttpTransport::new(Arc::new(RefreshingToken)).unwrap();
        let url = format!("{}/thing", server.uri());
        let result: String = transport
            .request(reqwest::Method::GET, &url, None::<&()>)
            .await
            .unwrap();
        assert_eq!(result, "ok");
    }

    #[tokio::test]
    async fn gives_up_as_unauthenticated_after_second_401() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(Arc::new(FixedToken)).unwrap();
        let url = format!("{}/thing", server.uri());
        let result = transport
            .request_unit(reqwest::Method::GET, &url, None::<&()>)
            .await;
        assert!(matches!(result, Err(RuntimeError::Unauthenticated)));
    }
}
