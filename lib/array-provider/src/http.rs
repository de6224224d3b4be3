// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! JSON-over-HTTPS plumbing shared by the array drivers and the catalog
//! client.
//!
//! Drivers describe each management call as an [`ApiRequest`] and hand it to
//! a [`RestClient`], which executes it through an [`HttpTransport`]. The
//! transport normally is [`ReqwestTransport`]; anything speaking the same
//! request/response shapes can stand in for it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
pub use reqwest::Method;
use serde::de::DeserializeOwned;
use slog::{debug, o, Logger};

use crate::error::{Result, StorageError};

/// Per-request timeout for management API calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// One management API call, relative to the endpoint's base URL.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub basic_auth: Option<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            query: Vec::new(),
            headers: Vec::new(),
            basic_auth: None,
            body: None,
        }
    }

    pub fn query(mut self, pairs: &[(&str, &str)]) -> Self {
        self.query
            .extend(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn basic_auth(mut self, username: &str, password: &str) -> Self {
        self.basic_auth = Some((username.to_string(), password.to_string()));
        self
    }

    pub fn json(mut self, body: &serde_json::Value) -> Self {
        self.body = Some(body.clone());
        self
    }

    /// First value of query parameter `key`.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// First value of header `name`, matched case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// What came back for an [`ApiRequest`]. Header names are lowercase.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// A response carrying `body` as JSON.
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.to_string().into_bytes(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Carries [`ApiRequest`]s to a management endpoint. Only failures to get
/// any answer are errors; HTTP error statuses come back as responses.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse>;
}

/// [`HttpTransport`] over a pooled reqwest client.
pub struct ReqwestTransport {
    client: reqwest::Client,
    base: String,
}

impl ReqwestTransport {
    /// Certificate verification is on unless `insecure` is set.
    pub fn new(base: &str, insecure: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StorageError::Connectivity {
                op: "build http client",
                target: base.to_string(),
                detail: e.to_string(),
            })?;
        Ok(Self { client, base: base.trim_end_matches('/').to_string() })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse> {
        let url = format!("{}{}", self.base, request.path);
        let unreachable = |e: reqwest::Error| StorageError::Connectivity {
            op: "http request",
            target: url.clone(),
            detail: e.to_string(),
        };

        let mut builder =
            self.client.request(request.method, &url).query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some((username, password)) = &request.basic_auth {
            builder = builder.basic_auth(username, Some(password));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(unreachable)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                Some((name.as_str().to_string(), value.to_str().ok()?.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(unreachable)?.to_vec();
        Ok(ApiResponse { status, headers, body })
    }
}

/// Client-side connection to a management REST endpoint.
pub(crate) struct RestClient {
    transport: Arc<dyn HttpTransport>,
    base: String,
    log: Logger,
}

impl RestClient {
    pub(crate) fn new(base: &str, insecure: bool, log: &Logger) -> Result<Self> {
        let transport = ReqwestTransport::new(base, insecure)?;
        Ok(Self::with_transport(base, Arc::new(transport), log))
    }

    pub(crate) fn with_transport(
        base: &str,
        transport: Arc<dyn HttpTransport>,
        log: &Logger,
    ) -> Self {
        let base = base.trim_end_matches('/').to_string();
        Self { transport, log: log.new(o!("endpoint" => base.clone())), base }
    }

    pub(crate) fn base(&self) -> &str {
        &self.base
    }

    /// Starts a request for `path`, which is appended to the base URL.
    pub(crate) fn request(&self, method: Method, path: &str) -> ApiRequest {
        debug!(self.log, "{} request to {}", method, path);
        ApiRequest::new(method, path)
    }

    // Sends "request", awaits "response", and returns an error on any
    // non-success status code.
    pub(crate) async fn send(
        &self,
        op: &'static str,
        target: &str,
        request: ApiRequest,
    ) -> Result<ApiResponse> {
        let response =
            self.transport.execute(request).await.map_err(|e| match e {
                StorageError::Connectivity { detail, .. } => {
                    StorageError::Connectivity {
                        op,
                        target: target.to_string(),
                        detail,
                    }
                }
                other => other,
            })?;

        if !response.is_success() {
            let body = String::from_utf8_lossy(&response.body).into_owned();
            debug!(self.log, "{op} {target} failed";
                "status" => response.status,
                "body" => &body,
            );
            return Err(StorageError::Api {
                op,
                target: target.to_string(),
                status: response.status,
                body,
            });
        }

        Ok(response)
    }

    // Sends a "request", awaits "response", and parses the body
    // into a deserializable type.
    pub(crate) async fn send_json<T: DeserializeOwned>(
        &self,
        op: &'static str,
        target: &str,
        request: ApiRequest,
    ) -> Result<T> {
        let response = self.send(op, target, request).await?;
        serde_json::from_slice(&response.body).map_err(|e| StorageError::Decode {
            op,
            target: target.to_string(),
            detail: e.to_string(),
        })
    }

    /// Sends a request whose response body is irrelevant.
    pub(crate) async fn send_empty(
        &self,
        op: &'static str,
        target: &str,
        request: ApiRequest,
    ) -> Result<()> {
        self.send(op, target, request).await.map(|_| ())
    }
}

/// Case-insensitive comparison of initiator identifiers. WWNs are reported
/// both with and without `:` separators depending on the source.
pub(crate) fn initiator_eq(a: &str, b: &str) -> bool {
    fn canon(s: &str) -> String {
        let s = s.trim().to_ascii_lowercase();
        if s.starts_with("iqn.") || s.starts_with("eui.") || s.starts_with("naa.")
        {
            s
        } else {
            s.replace(':', "")
        }
    }
    canon(a) == canon(b)
}
