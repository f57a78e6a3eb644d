//! SIP message types and header accessors

use crate::domain::shared::value_objects::CallId;
use bytes::Bytes;
use rsip::{Header, Headers, Method, Request, Response, Uri};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

/// Header name as printed on the wire
pub fn header_name(header: &Header) -> String {
    let line = header.to_string();
    match line.split_once(':') {
        Some((name, _)) => name.trim().to_string(),
        None => line,
    }
}

/// Header value without the `Name:` prefix
pub fn header_value(header: &Header) -> String {
    let line = header.to_string();
    match line.split_once(':') {
        Some((_, value)) => value.trim().to_string(),
        None => String::new(),
    }
}

/// Value of a `;name=value` parameter in a header value
pub fn header_param(value: &str, name: &str) -> Option<String> {
    // Parameters after the closing '>' belong to the header, not the URI
    let params = match value.rfind('>') {
        Some(pos) => &value[pos + 1..],
        None => value,
    };
    params.split(';').skip(1).find_map(|param| {
        let (key, val) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| val.trim().to_string())
    })
}

/// URI part of a name-addr (`"Bob" <sip:bob@host>;tag=x` -> `sip:bob@host`)
pub fn addr_spec(value: &str) -> &str {
    match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if start < end => &value[start + 1..end],
        _ => value.split(';').next().unwrap_or(value).trim(),
    }
}

/// `host:port` of a URI, defaulting to 5060
pub fn host_port(uri: &Uri) -> String {
    let host = uri.host_with_port.to_string();
    if host.starts_with('[') {
        if host.contains("]:") {
            host
        } else {
            format!("{}:5060", host)
        }
    } else if host.contains(':') {
        host
    } else {
        format!("{}:5060", host)
    }
}

/// Header access shared by requests and responses
pub trait SipHeaders {
    fn headers(&self) -> &Headers;
    fn headers_mut(&mut self) -> &mut Headers;

    /// All headers named `name` (case-insensitive), in order
    fn get_headers(&self, name: &str) -> Vec<&Header> {
        self.headers()
            .iter()
            .filter(|h| header_name(h).eq_ignore_ascii_case(name))
            .collect()
    }

    fn header(&self, name: &str) -> Option<String> {
        self.get_headers(name).first().map(|h| header_value(h))
    }

    fn append_header(&mut self, header: Header) {
        self.headers_mut().push(header);
    }

    fn call_id(&self) -> Option<CallId> {
        self.header("Call-ID").map(CallId::new)
    }

    /// Sequence number and method of the CSeq header
    fn cseq(&self) -> Option<(u32, String)> {
        let value = self.header("CSeq")?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = parts.next()?.to_string();
        Some((seq, method))
    }

    fn from_header(&self) -> Option<String> {
        self.header("From")
    }

    fn to_header(&self) -> Option<String> {
        self.header("To")
    }

    fn from_tag(&self) -> Option<String> {
        self.from_header().and_then(|v| header_param(&v, "tag"))
    }

    fn to_tag(&self) -> Option<String> {
        self.to_header().and_then(|v| header_param(&v, "tag"))
    }

    fn contact_uri(&self) -> Option<String> {
        self.header("Contact").map(|v| addr_spec(&v).to_string())
    }

    /// Branch parameter of the topmost Via
    fn via_branch(&self) -> Option<String> {
        self.header("Via").and_then(|v| header_param(&v, "branch"))
    }

    fn content_type(&self) -> Option<String> {
        self.header("Content-Type")
    }
}

/// Copy every `name` header of `src` onto `dst`
pub fn copy_headers(name: &str, src: &impl SipHeaders, dst: &mut impl SipHeaders) {
    let copied: Vec<Header> = src.get_headers(name).into_iter().cloned().collect();
    for header in copied {
        dst.append_header(header);
    }
}

/// SIP Request wrapper
#[derive(Debug, Clone, PartialEq)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    /// One-line summary for logs
    pub fn short(&self) -> String {
        format!(
            "{} {} (call-id {})",
            self.inner.method,
            self.inner.uri,
            self.call_id().map(|c| c.to_string()).unwrap_or_default()
        )
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

impl SipHeaders for SipRequest {
    fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.inner.headers
    }
}

/// SIP Response wrapper
///
/// Carries its own reason phrase so that a caller-supplied reason is sent
/// verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct SipResponse {
    pub inner: Response,
    reason: String,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        let code: u16 = inner.status_code.clone().into();
        Self {
            inner,
            reason: reason_phrase(code).to_string(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code())
    }

    pub fn is_final(&self) -> bool {
        self.status_code() >= 200
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = format!("SIP/2.0 {} {}\r\n", self.status_code(), self.reason);
        for header in self.inner.headers.iter() {
            out.push_str(&header.to_string());
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        let mut data = out.into_bytes();
        data.extend_from_slice(&self.inner.body);
        Bytes::from(data)
    }
}

impl SipHeaders for SipResponse {
    fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.inner.headers
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        if data.starts_with(b"SIP/") {
            return SipResponse::parse(data).map(SipMessage::Response);
        }
        SipRequest::parse(data).map(SipMessage::Request)
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

/// Default reason phrase for a status code
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call Is Being Forwarded",
        182 => "Queued",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Moved Temporarily",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        600 => "Busy Everywhere",
        603 => "Decline",
        604 => "Does Not Exist Anywhere",
        606 => "Not Acceptable",
        100..=199 => "Session Progress",
        200..=299 => "OK",
        300..=399 => "Redirection",
        400..=499 => "Client Error",
        500..=599 => "Server Error",
        _ => "Global Failure",
    }
}
