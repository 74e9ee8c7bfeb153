//! HTTP requests issued outside the persistent transport.
//!
//! The client only needs two round trips over plain HTTP: `GET /negotiate`
//! and the best-effort `POST /abort`. Both go through [`HttpClient`] so the
//! network layer can be swapped out (tests use a scripted implementation).

use async_trait::async_trait;
use http::StatusCode;
use url::Url;

use crate::error::Result;

/// Status and body of a completed HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: String,
}

/// A minimal HTTP client.
///
/// Dropping the returned future must abort the request; the client relies on
/// this to cancel an in-flight negotiate when it is stopped.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Issues a `GET` request.
    async fn get(&self, url: &Url) -> Result<HttpResponse>;

    /// Issues a `POST` request with an empty body.
    async fn post(&self, url: &Url) -> Result<HttpResponse>;
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(&self, url: &Url) -> Result<HttpResponse> {
        let response = self
            .client
            .get(url.as_str())
            .header("Accept", "application/json")
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }

    async fn post(&self, url: &Url) -> Result<HttpResponse> {
        let response = self.client.post(url.as_str()).send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }
}
