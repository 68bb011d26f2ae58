//! # HTTP Retrieval Utilities
//!
//! This module provides a robust, asynchronous API client wrapper around `reqwest`.
//! It includes optional middleware support for exponential backoff retries,
//! standardized JSON response handling, status-only requests for endpoints that
//! answer with `204 No Content`, and streamed responses for large downloads.

use std::time::Duration;

use reqwest::{header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE}, Method};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::{de::DeserializeOwned, Serialize};
use url::Url;

/// A standardized container for API responses.
///
/// This struct wraps the deserialized data along with metadata about the
/// HTTP transaction, such as status codes and headers.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The successfully deserialized response body, if any.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

/// Tuning knobs for an `ApiClient`.
#[derive(Debug, Clone)]
pub struct ApiClientOptions {
    /// Number of transient-failure retries; `0` disables the retry middleware.
    pub max_retries: u32,
    /// Whole-request timeout (connect + body). `None` means no limit.
    pub timeout: Option<Duration>,
    /// Value of the `User-Agent` header.
    pub user_agent: String,
}

impl Default for ApiClientOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: None,
            user_agent: concat!("engine-control/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// A flexible asynchronous HTTP client.
///
/// Built on top of `reqwest_middleware`, it handles base URLs,
/// authentication tokens, and automatic retries.
pub struct ApiClient {
    /// The underlying middleware-enabled client.
    inner: ClientWithMiddleware,
    /// The base URL to which all relative paths are joined.
    base_url: Url,
    /// An optional Bearer token used for authorization.
    auth_token: Option<String>,
}

impl ApiClient {
    /// Creates a new `ApiClient` with the default retry policy (3 retries).
    ///
    /// # Arguments
    /// * `base_url` - The absolute base URL for the API (e.g., "https://api.example.com/v1/").
    /// * `auth_token` - An optional string for the Authorization header.
    ///
    /// # Errors
    /// Returns an error if `base_url` is not a valid absolute URL.
    pub fn new(base_url: &str, auth_token: Option<String>) -> anyhow::Result<Self> {
        Self::with_options(base_url, auth_token, ApiClientOptions::default())
    }

    /// Creates a new `ApiClient` with explicit retry/timeout settings.
    ///
    /// Empty tokens are treated as "no token" so callers can pass a
    /// configured-but-blank secret straight through.
    pub fn with_options(
        base_url: &str,
        auth_token: Option<String>,
        options: ApiClientOptions,
    ) -> anyhow::Result<Self> {
        // Parse the base URL to ensure it is valid and absolute
        let url = Url::parse(base_url)?;

        let mut builder = reqwest::Client::builder().user_agent(options.user_agent.clone());
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build()?;

        // Only install the retry middleware when retries are wanted
        let client = if options.max_retries > 0 {
            let retry_policy = ExponentialBackoff::builder().build_with_max_retries(options.max_retries);
            ClientBuilder::new(http)
                .with(RetryTransientMiddleware::new_with_policy(retry_policy))
                .build()
        } else {
            ClientBuilder::new(http).build()
        };

        Ok(Self {
            inner: client,
            base_url: url,
            auth_token: auth_token.filter(|t| !t.is_empty()),
        })
    }

    /// The base URL every relative path is joined onto.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Joins `path` onto the base URL and applies the bearer token.
    ///
    /// An absolute `path` replaces the base URL entirely, which is how
    /// download links pointing at another host are followed.
    fn prepare(&self, method: Method, path: &str) -> anyhow::Result<RequestBuilder> {
        let full_url = self.base_url.join(path)?;
        let mut req = self.inner.request(method, full_url);
        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        Ok(req)
    }

    /// Performs a generic HTTP request and handles the response.
    ///
    /// This method manages URL joining, header injection, authentication,
    /// and JSON serialization/deserialization.
    ///
    /// # Arguments
    /// * `method` - The HTTP verb (GET, POST, etc.).
    /// * `path` - The relative path to append to the base URL.
    /// * `headers` - Optional additional headers for this specific request.
    /// * `body` - Optional serializable object to send as the JSON body.
    ///
    /// # Errors
    /// Returns an `anyhow::Error` if URL joining, network execution or
    /// deserialization of a successful body fails.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<B>,
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        // 1. Construct the request against the absolute URL
        let mut req = self.prepare(method, path)?;

        // 2. Add Custom Headers if provided
        if let Some(h) = headers {
            req = req.headers(h);
        }

        // 3. Serialize and attach the JSON body if present
        if let Some(b) = body {
            let json_body = serde_json::to_string(&b)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        // 4. Execute the request and capture response metadata
        let response: reqwest::Response = req.send().await?;
        let status = response.status();
        let resp_headers = response.headers().clone();
        let success = status.is_success();

        // 5. Handle the result based on success status
        if success {
            let data = response.json::<T>().await?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            // Capture the error body as a string for debugging
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }

    /// Sends a request and returns only the status code, discarding the body.
    ///
    /// Used for endpoints whose contract is expressed purely in status codes
    /// (health checks, `DELETE`, `PUT`/`PATCH` answering `204`).
    pub async fn send_status<B>(&self, method: Method, path: &str, body: Option<B>) -> anyhow::Result<u16>
    where
        B: Serialize,
    {
        let mut req = self.prepare(method, path)?;
        if let Some(b) = body {
            let json_body = serde_json::to_string(&b)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }
        let response = req.send().await?;
        Ok(response.status().as_u16())
    }

    /// Starts a GET and hands back the raw response so the caller can stream
    /// the body (`Response::bytes_stream`) and read `content_length`.
    pub async fn get_stream(&self, path: &str) -> anyhow::Result<reqwest::Response> {
        let response = self.prepare(Method::GET, path)?.send().await?;
        Ok(response)
    }
}
