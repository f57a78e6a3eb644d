//! SIP message builder utilities

use super::message::{header_param, SipHeaders, SipRequest, SipResponse};
use crate::domain::shared::value_objects::CallId;
use rsip::{Header, Headers, Method, Request, Response, StatusCode, Uri, Version};
use std::net::SocketAddr;

const MAX_FORWARDS: &str = "70";

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    reason: Option<String>,
    to_tag: Option<String>,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            reason: None,
            to_tag: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn server_internal_error() -> Self {
        Self::new(500)
    }

    /// Reason phrase sent instead of the default for the code
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        if !reason.is_empty() {
            self.reason = Some(reason);
        }
        self
    }

    /// Tag added to the To header unless the request already carries one
    pub fn to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> SipResponse {
        let mut headers = Vec::new();

        // Copy essential headers from request
        for header in request.headers().iter() {
            match header {
                Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_) => {
                    headers.push(header.clone());
                }
                Header::To(to) => {
                    let value = to.to_string();
                    let value = value
                        .split_once(':')
                        .map(|(_, v)| v.trim().to_string())
                        .unwrap_or(value);
                    match &self.to_tag {
                        Some(tag) if header_param(&value, "tag").is_none() => {
                            headers.push(Header::To(format!("{};tag={}", value, tag).into()));
                        }
                        _ => headers.push(header.clone()),
                    }
                }
                _ => {}
            }
        }

        headers.extend(self.headers);
        headers.push(Header::ContentLength(self.body.len().to_string().into()));

        let response = Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(headers),
            body: self.body,
            version: Version::V2,
        };

        match self.reason {
            Some(reason) => SipResponse::new(response).with_reason(reason),
            None => SipResponse::new(response),
        }
    }
}

/// Build an outgoing SIP request
pub struct RequestBuilder {
    method: Method,
    uri: Uri,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl RequestBuilder {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Top Via for a request sent from `local` over UDP
    pub fn via(mut self, local: SocketAddr, branch: &str) -> Self {
        self.headers.push(Header::Via(
            format!("SIP/2.0/UDP {};branch={};rport", local, branch).into(),
        ));
        self
    }

    pub fn from(mut self, name_addr: &str, tag: &str) -> Self {
        self.headers
            .push(Header::From(format!("{};tag={}", name_addr, tag).into()));
        self
    }

    /// To header given as a full value, tag included when known
    pub fn to(mut self, value: &str) -> Self {
        self.headers.push(Header::To(value.to_string().into()));
        self
    }

    pub fn call_id(mut self, call_id: &CallId) -> Self {
        self.headers
            .push(Header::CallId(call_id.as_str().to_string().into()));
        self
    }

    pub fn cseq(mut self, seq: u32) -> Self {
        self.headers
            .push(Header::CSeq(format!("{} {}", seq, self.method).into()));
        self
    }

    pub fn contact(mut self, uri: &str) -> Self {
        self.headers.push(Header::Contact(format!("<{}>", uri).into()));
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn body(mut self, body: Vec<u8>, content_type: &str) -> Self {
        if !body.is_empty() {
            self.headers
                .push(Header::ContentType(content_type.to_string().into()));
        }
        self.body = body;
        self
    }

    pub fn build(mut self) -> SipRequest {
        let has_max_forwards = self
            .headers
            .iter()
            .any(|h| matches!(h, Header::MaxForwards(_)));
        if !has_max_forwards {
            self.headers.push(Header::MaxForwards(MAX_FORWARDS.into()));
        }
        self.headers
            .push(Header::ContentLength(self.body.len().to_string().into()));

        SipRequest::new(Request {
            method: self.method,
            uri: self.uri,
            version: Version::V2,
            headers: Headers::from(self.headers),
            body: self.body,
        })
    }
}

/// CANCEL for a pending INVITE: same Request-URI, top Via, From, To,
/// Call-ID and CSeq number (RFC 3261 9.1)
pub fn cancel_for(invite: &SipRequest) -> SipRequest {
    build_from_invite(Method::Cancel, invite, None)
}

/// ACK for a non-2xx final response, sent in the INVITE's transaction
pub fn ack_for_failure(invite: &SipRequest, response: &SipResponse) -> SipRequest {
    build_from_invite(Method::Ack, invite, response.to_header())
}

fn build_from_invite(method: Method, invite: &SipRequest, to: Option<String>) -> SipRequest {
    let mut headers = Vec::new();

    if let Some(via) = invite.get_headers("Via").first() {
        headers.push((*via).clone());
    }
    for header in invite.headers().iter() {
        match header {
            Header::From(_) | Header::CallId(_) | Header::Route(_) => headers.push(header.clone()),
            Header::To(_) if to.is_none() => headers.push(header.clone()),
            _ => {}
        }
    }
    if let Some(to) = to {
        headers.push(Header::To(to.into()));
    }

    let seq = invite.cseq().map(|(seq, _)| seq).unwrap_or(1);
    headers.push(Header::CSeq(format!("{} {}", seq, method).into()));
    headers.push(Header::MaxForwards(MAX_FORWARDS.into()));
    headers.push(Header::ContentLength("0".into()));

    SipRequest::new(Request {
        method,
        uri: invite.uri().clone(),
        version: Version::V2,
        headers: Headers::from(headers),
        body: Vec::new(),
    })
}
