//! W3C trace-context propagation for outbound calls

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use std::fmt::Write;

pub const TRACEPARENT: &str = "traceparent";
pub const TRACE_ID_HEADER: &str = "x-trace-id";
pub const SPAN_ID_HEADER: &str = "x-span-id";

const SAMPLED: &str = "01";

/// Trace and span identifiers carried on an outbound request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceContext {
    /// 32 hex digits
    pub trace_id: String,
    /// 16 hex digits
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub flags: String,
}

impl TraceContext {
    /// Start a new sampled trace
    pub fn new() -> Self {
        Self {
            trace_id: generate_trace_id(),
            span_id: generate_span_id(),
            parent_span_id: None,
            flags: SAMPLED.to_string(),
        }
    }

    /// Parse a `traceparent` value (`version-trace_id-span_id-flags`)
    pub fn from_traceparent(value: &str) -> Option<Self> {
        let parts: Vec<&str> = value.trim().split('-').collect();
        if parts.len() != 4 {
            return None;
        }
        let (version, trace_id, span_id, flags) = (parts[0], parts[1], parts[2], parts[3]);
        if !is_hex(version, 2) || !is_hex(trace_id, 32) || !is_hex(span_id, 16) || !is_hex(flags, 2)
        {
            return None;
        }
        // All-zero ids are invalid per the trace-context format
        if trace_id.bytes().all(|b| b == b'0') || span_id.bytes().all(|b| b == b'0') {
            return None;
        }

        Some(Self {
            trace_id: trace_id.to_lowercase(),
            span_id: span_id.to_lowercase(),
            parent_span_id: None,
            flags: flags.to_lowercase(),
        })
    }

    /// Continue this trace with a fresh span
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: generate_span_id(),
            parent_span_id: Some(self.span_id.clone()),
            flags: self.flags.clone(),
        }
    }

    /// Continue the trace found in `headers`, or start a new one
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(TRACEPARENT)
            .and_then(|value| value.to_str().ok())
            .and_then(Self::from_traceparent)
            .map(|parent| parent.child())
            .unwrap_or_default()
    }

    pub fn traceparent(&self) -> String {
        format!("00-{}-{}-{}", self.trace_id, self.span_id, self.flags)
    }

    /// Write `traceparent`, `X-Trace-ID` and `X-Span-ID`
    pub fn inject(&self, headers: &mut HeaderMap) {
        let entries = [
            (TRACEPARENT, self.traceparent()),
            (TRACE_ID_HEADER, self.trace_id.clone()),
            (SPAN_ID_HEADER, self.span_id.clone()),
        ];
        for (name, value) in entries {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(HeaderName::from_static(name), value);
            }
        }
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

fn is_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_hexdigit())
}

fn random_hex(bytes: usize) -> String {
    let mut id = String::with_capacity(bytes * 2);
    for _ in 0..bytes {
        write!(&mut id, "{:02x}", rand::random::<u8>()).ok();
    }
    id
}

/// Generate a new trace ID (random 32 hex digits)
pub fn generate_trace_id() -> String {
    random_hex(16)
}

/// Generate a new span ID (random 16 hex digits)
pub fn generate_span_id() -> String {
    random_hex(8)
}
