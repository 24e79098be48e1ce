//! Request, response and per-request context types.
//!
//! # JSF Compliance
//!
//! Headers use `SmallVec` so the common case (≤16 headers) stays off the heap.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::Method;
use serde_json::Value;
use smallvec::SmallVec;

use crate::app_scope::AppScope;
use crate::error::PipelineError;
use crate::ids::RequestId;

/// Maximum inline headers before heap allocation
/// Most requests have ≤16 headers (JSF: no heap in hot path)
pub const MAX_INLINE_HEADERS: usize = 16;

/// Ordered header multimap with case-insensitive lookups.
///
/// # JSF Optimization (P2)
///
/// Header names use `Arc<str>` because they repeat across requests
/// (Content-Type, Authorization, ...) and `Arc::clone()` is O(1).
pub type HeaderVec = SmallVec<[(Arc<str>, String); MAX_INLINE_HEADERS]>;

fn find_header<'a>(headers: &'a HeaderVec, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Lazy, finite, one-shot request body.
///
/// Reading consumes the body; a second read fails instead of silently
/// returning nothing.
#[derive(Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Vec<u8>),
    Stream(Box<dyn Read + Send>),
    Consumed,
}

impl Body {
    #[must_use]
    pub fn from_reader<R: Read + Send + 'static>(reader: R) -> Self {
        Body::Stream(Box::new(reader))
    }

    /// Read the whole body, leaving [`Body::Consumed`] behind.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        match std::mem::replace(self, Body::Consumed) {
            Body::Empty => Ok(Vec::new()),
            Body::Bytes(bytes) => Ok(bytes),
            Body::Stream(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf)?;
                Ok(buf)
            }
            Body::Consumed => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "request body already consumed",
            )),
        }
    }

    /// Read the body and parse it as JSON. An empty body yields `None`.
    pub fn read_json(&mut self) -> Result<Option<Value>, PipelineError> {
        let bytes = self
            .read_all()
            .map_err(|e| PipelineError::validation(format!("unreadable body: {e}")))?;
        if bytes.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| PipelineError::validation(format!("invalid JSON body: {e}")))
    }

    #[must_use]
    pub fn is_consumed(&self) -> bool {
        matches!(self, Body::Consumed)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Bytes(b) => write!(f, "Body::Bytes({} bytes)", b.len()),
            Body::Stream(_) => f.write_str("Body::Stream(..)"),
            Body::Consumed => f.write_str("Body::Consumed"),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Bytes(bytes)
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Body::Bytes(s.as_bytes().to_vec())
    }
}

/// Inbound request as produced by whatever transport sits in front of the
/// pipeline.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub headers: HeaderVec,
    pub body: Body,
}

impl Request {
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderVec::new(),
            body: Body::Empty,
        }
    }

    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    #[must_use]
    pub fn post(path: impl Into<String>, body: impl Into<Body>) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    /// Append a header; duplicates are kept in order.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((Arc::from(name), value.into()));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Get a header by name (case-insensitive per RFC 7230)
    #[inline]
    #[must_use]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Shared cancellation flag of one request.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Lifecycle state of one request while it walks its chain.
///
/// Owned by a single dispatcher for the duration of the request; never shared
/// across requests. `locals` starts empty and is dropped with the context.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub method: Method,
    pub path: String,
    pub headers: HeaderVec,
    pub body: Body,
    /// Per-request scratch space shared between the entries of one chain.
    pub locals: HashMap<String, Value>,
    app: Arc<AppScope>,
    error: Option<PipelineError>,
    started: Instant,
    deadline: Instant,
    cancel: CancelFlag,
}

impl RequestContext {
    #[must_use]
    pub fn new(request: Request, app: Arc<AppScope>, deadline: Duration) -> Self {
        let request_id = RequestId::from_header_or_new(request.get_header("x-request-id"));
        Self::with_id(request, request_id, app, deadline)
    }

    /// Context for a request whose id was assigned by the caller.
    #[must_use]
    pub fn with_id(
        request: Request,
        request_id: RequestId,
        app: Arc<AppScope>,
        deadline: Duration,
    ) -> Self {
        let started = Instant::now();
        Self {
            request_id,
            method: request.method,
            path: request.path,
            headers: request.headers,
            body: request.body,
            locals: HashMap::new(),
            app,
            error: None,
            started,
            deadline: started + deadline,
            cancel: CancelFlag::default(),
        }
    }

    /// Get a header by name (case-insensitive per RFC 7230)
    #[inline]
    #[must_use]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    #[must_use]
    pub fn app(&self) -> &AppScope {
        &self.app
    }

    #[must_use]
    pub fn local(&self, key: &str) -> Option<&Value> {
        self.locals.get(key)
    }

    pub fn set_local(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.locals.insert(key.into(), value.into());
    }

    /// The error currently attached, if the request is in the error segment.
    #[must_use]
    pub fn error(&self) -> Option<&PipelineError> {
        self.error.as_ref()
    }

    /// Attach an error, returning the one it replaces.
    pub(crate) fn attach_error(&mut self, error: PipelineError) -> Option<PipelineError> {
        self.error.replace(error)
    }

    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the request deadline (zero once passed).
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }
}

/// Response produced by exactly one terminal entry (or synthesised by the
/// dispatcher).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderVec,
    pub body: Vec<u8>,
}

impl Response {
    #[must_use]
    pub fn new(status: u16, headers: HeaderVec, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// A response with no body and no headers.
    #[must_use]
    pub fn empty(status: u16) -> Self {
        Self::new(status, HeaderVec::new(), Vec::new())
    }

    /// Create a JSON response with default headers
    #[must_use]
    pub fn json(status: u16, body: &Value) -> Self {
        let mut headers = HeaderVec::new();
        headers.push((Arc::from("content-type"), "application/json".to_string()));
        Self {
            status,
            headers,
            body: body.to_string().into_bytes(),
        }
    }

    #[must_use]
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        let mut headers = HeaderVec::new();
        headers.push((
            Arc::from("content-type"),
            "text/plain; charset=utf-8".to_string(),
        ));
        Self {
            status,
            headers,
            body: body.into().into_bytes(),
        }
    }

    /// Create an error response
    #[must_use]
    pub fn error(status: u16, message: &str) -> Self {
        Self::json(status, &serde_json::json!({ "error": message }))
    }

    /// Get a header by name
    #[inline]
    #[must_use]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Add or update a header
    pub fn set_header(&mut self, name: &str, value: String) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((Arc::from(name), value));
    }

    /// Body parsed as JSON, if it is JSON.
    #[must_use]
    pub fn body_json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }

    #[must_use]
    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap_or("")
    }
}
