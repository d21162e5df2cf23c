//! Transport client: one HTTP call in, one normalized result out.
//!
//! HTTP-level failures never escape as anything other than an `ErrorInfo`
//! value. A request that is malformed before sending (relative URI, body
//! that cannot be serialized) is rejected when the `Request` is built.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use reqwest::header::{ACCEPT, HeaderName, HeaderValue, USER_AGENT};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{ErrorInfo, RequestError};
use crate::session::Session;

/// HTTP methods the management APIs are called with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Patch,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Patch => "PATCH",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(m: Method) -> Self {
        match m {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Parse and check an absolute http(s) URI.
pub fn parse_absolute(uri: &str) -> Result<Url, RequestError> {
    let url = Url::parse(uri).map_err(|e| RequestError::InvalidUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(RequestError::UnsupportedScheme(uri.to_string())),
    }
}

/// A validated request, ready to send.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: Url,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Option<Value>,
    timeout: Option<Duration>,
}

/// Validate a header pair before it is attached to any request.
pub fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), RequestError> {
    let invalid = |reason: String| RequestError::InvalidHeader {
        name: name.to_string(),
        reason,
    };
    let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
    let header_value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
    Ok((header_name, header_value))
}

impl Request {
    pub fn new(method: Method, uri: &str) -> Result<Self, RequestError> {
        Ok(Self::from_url(method, parse_absolute(uri)?))
    }

    pub fn from_url(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(uri: &str) -> Result<Self, RequestError> {
        Self::new(Method::Get, uri)
    }

    /// Append a query parameter (percent-encoded).
    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.url.query_pairs_mut().append_pair(key, value);
        self
    }

    pub fn header(self, name: &str, value: &str) -> Result<Self, RequestError> {
        Ok(self.with_parsed_header(parse_header(name, value)?))
    }

    pub(crate) fn with_parsed_header(mut self, header: (HeaderName, HeaderValue)) -> Self {
        self.headers.push(header);
        self
    }

    /// Bound this call tighter than the transport-wide timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a JSON body. Serialization happens here, not at send time.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, RequestError> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &[(HeaderName, HeaderValue)] {
        &self.headers
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }
}

/// Body of a successful response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    /// 204 or a zero-length body.
    Empty,
}

/// A successful (2xx) response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: ResponseBody,
}

impl Response {
    pub fn json(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Json(v) => Some(v),
            ResponseBody::Empty => None,
        }
    }

    pub fn into_json(self) -> Option<Value> {
        match self.body {
            ResponseBody::Json(v) => Some(v),
            ResponseBody::Empty => None,
        }
    }
}

/// Something that can perform one HTTP call.
pub trait Transport: Send + Sync {
    fn send(&self, request: &Request) -> Result<Response, ErrorInfo>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn send(&self, request: &Request) -> Result<Response, ErrorInfo> {
        (**self).send(request)
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, request: &Request) -> Result<Response, ErrorInfo> {
        (**self).send(request)
    }
}

/// Blocking HTTP transport authenticated with a bearer token.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    session: Session,
}

impl HttpTransport {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(session: Session, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self { client, session })
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: &Request) -> Result<Response, ErrorInfo> {
        let mut builder = self
            .client
            .request(request.method().into(), request.url().clone())
            .bearer_auth(self.session.token())
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, self.session.user_agent());
        for (name, value) in request.headers() {
            builder = builder.header(name.clone(), value.clone());
        }
        if let Some(timeout) = request.timeout() {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = request.body() {
            builder = builder.json(body);
        }

        debug!(method = %request.method(), path = %request.url().path(), "Sending request");

        let response = builder.send().map_err(network_error)?;
        let status = response.status().as_u16();
        let text = response.text().map_err(network_error)?;

        debug!(
            method = %request.method(),
            path = %request.url().path(),
            status = status,
            "Received response"
        );

        decode(status, &text)
    }
}

fn network_error(e: reqwest::Error) -> ErrorInfo {
    if e.is_builder() {
        return ErrorInfo::permanent(format!("Request could not be built: {}", e));
    }
    ErrorInfo::transient(format!("Network error: {}", e))
}

/// Turn a status code and raw body into a `Response` or a classified error.
pub fn decode(status: u16, text: &str) -> Result<Response, ErrorInfo> {
    if (200..300).contains(&status) {
        if text.trim().is_empty() {
            return Ok(Response {
                status,
                body: ResponseBody::Empty,
            });
        }
        return match serde_json::from_str(text) {
            Ok(v) => Ok(Response {
                status,
                body: ResponseBody::Json(v),
            }),
            Err(e) => Err(ErrorInfo {
                http_status: Some(status),
                ..ErrorInfo::unknown(format!("Invalid JSON in response body: {}", e))
            }),
        };
    }

    // Graph and ARM both use {"error": {"code": ..., "message": ...}}
    let envelope: Option<Value> = serde_json::from_str(text).ok();
    let error = envelope.as_ref().and_then(|v| v.get("error"));
    let code = error
        .and_then(|e| e.get("code"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let message = error
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            reqwest::StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("HTTP error")
                .to_string()
        });

    Err(ErrorInfo::from_status(status, code, message))
}
