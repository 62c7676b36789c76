use std::fmt;
use std::str::FromStr;

use anyhow::Error;
use thiserror::Error;

use crate::abnf;
use crate::headers::{
    parse_value, Address, Cseq, HeaderName, HeaderValue, Headers, Method, Via,
};
use crate::transport::Remote;
use crate::uri::Uri;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed request")]
    BadRequest,
    #[error("malformed response")]
    BadResponse,
    #[error("stream message carries no content-length")]
    NoContentLength,
    #[error("datagram shorter than its content-length")]
    ContentTooSmall,
    #[error("message is not a request")]
    NotRequest,
    #[error("message is not a response")]
    NotResponse,
    #[error("no via header in message")]
    NoVia,
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("invalid {0} header")]
    InvalidHeader(&'static str),
    #[error("invalid start line")]
    InvalidStartLine,
    #[error("invalid uri")]
    InvalidUri,
    #[error("invalid via header")]
    InvalidVia,
    #[error("invalid address")]
    InvalidAddress,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StartLine {
    Request { method: Method, uri: Uri },
    Response { code: u16, reason: String },
}

/// A SIP request or response. Headers are an ordered sequence; values
/// parsed off the wire stay in raw form until a typed accessor asks for
/// them. `remote` is the resolved peer endpoint, never serialized.
#[derive(Clone, Debug)]
pub struct Message {
    pub start: StartLine,
    pub headers: Headers,
    pub body: Option<String>,
    pub remote: Option<Remote>,
}

impl Message {
    pub fn request(method: Method, uri: Uri) -> Message {
        Message {
            start: StartLine::Request { method, uri },
            headers: Headers::new(),
            body: None,
            remote: None,
        }
    }

    pub fn response(code: u16, reason: &str) -> Message {
        Message {
            start: StartLine::Response {
                code,
                reason: reason.to_string(),
            },
            headers: Headers::new(),
            body: None,
            remote: None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        !self.is_request()
    }

    pub fn method(&self) -> Option<&Method> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn code(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { code, .. } => Some(*code),
            StartLine::Request { .. } => None,
        }
    }

    pub fn request_uri(&self) -> Option<&Uri> {
        match &self.start {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn is_invite(&self) -> bool {
        match self.method() {
            Some(m) => m == &Method::Invite,
            None => self
                .cseq()
                .map(|c| c.method == Method::Invite)
                .unwrap_or(false),
        }
    }

    /// The method this message belongs to for transaction matching: the
    /// request method, or the CSeq method of a response.
    pub fn cseq_method(&self) -> Result<Method, Error> {
        match self.method() {
            Some(m) => Ok(m.clone()),
            None => Ok(self.cseq()?.method),
        }
    }

    pub fn cseq(&self) -> Result<Cseq, Error> {
        match self.headers.typed(&HeaderName::Cseq)? {
            Some(HeaderValue::Cseq(c)) => Ok(c),
            _ => Err(MessageError::MissingHeader("CSeq"))?,
        }
    }

    pub fn vias(&self) -> Result<Vec<Via>, Error> {
        let mut out = Vec::new();
        for value in self.headers.typed_all(&HeaderName::Via)? {
            if let HeaderValue::Via(items) = value {
                out.extend(items);
            }
        }
        Ok(out)
    }

    pub fn top_via(&self) -> Result<Via, Error> {
        self.vias()?
            .into_iter()
            .next()
            .ok_or_else(|| MessageError::NoVia.into())
    }

    pub fn from_addr(&self) -> Result<Address, Error> {
        match self.headers.typed(&HeaderName::From)? {
            Some(HeaderValue::Address(a)) => Ok(a),
            _ => Err(MessageError::MissingHeader("From"))?,
        }
    }

    pub fn to_addr(&self) -> Result<Address, Error> {
        match self.headers.typed(&HeaderName::To)? {
            Some(HeaderValue::Address(a)) => Ok(a),
            _ => Err(MessageError::MissingHeader("To"))?,
        }
    }

    pub fn call_id(&self) -> Result<String, Error> {
        match self.headers.typed(&HeaderName::CallId)? {
            Some(HeaderValue::Text(s)) => Ok(s),
            _ => Err(MessageError::MissingHeader("Call-ID"))?,
        }
    }

    fn address_list(&self, name: &HeaderName) -> Result<Vec<Address>, Error> {
        let mut out = Vec::new();
        for value in self.headers.typed_all(name)? {
            match value {
                HeaderValue::Addresses(items) => out.extend(items),
                HeaderValue::Address(a) => out.push(a),
                _ => {}
            }
        }
        Ok(out)
    }

    pub fn contacts(&self) -> Result<Vec<Address>, Error> {
        self.address_list(&HeaderName::Contact)
    }

    pub fn routes(&self) -> Result<Vec<Address>, Error> {
        self.address_list(&HeaderName::Route)
    }

    pub fn record_routes(&self) -> Result<Vec<Address>, Error> {
        self.address_list(&HeaderName::RecordRoute)
    }

    pub fn content_length(&self) -> Result<Option<u32>, Error> {
        match self.headers.typed(&HeaderName::ContentLength)? {
            Some(HeaderValue::Int(n)) => Ok(Some(n)),
            _ => Ok(None),
        }
    }

    /// Where a request is headed: the first Route when one is present,
    /// otherwise the request URI.
    pub fn dest_uri(&self) -> Result<Uri, Error> {
        let routes = self.routes()?;
        if let Some(first) = routes.first() {
            return Ok(first.uri.clone());
        }
        Ok(self.request_uri().ok_or(MessageError::NotRequest)?.clone())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Parse every known header into typed form and pin Content-Length to
    /// the body length as the final header. Formatting a normalized message
    /// and parsing it back yields an equal normalized message.
    pub fn normalize(mut self) -> Result<Message, Error> {
        let mut headers = Headers::new();
        for h in self.headers.iter() {
            if h.name == HeaderName::ContentLength {
                continue;
            }
            let value = match &h.value {
                HeaderValue::Raw(raw) => parse_value(&h.name, raw)?,
                v => v.clone(),
            };
            headers.push(h.name.clone(), value);
        }
        let body_len = self.body.as_ref().map(|b| b.len()).unwrap_or(0);
        headers
            .push(HeaderName::ContentLength, HeaderValue::Int(body_len as u32));
        self.headers = headers;
        Ok(self)
    }

    /// Build a response skeleton from a request per RFC 3261 §8.2.6: Via,
    /// From, To, Call-ID and CSeq are copied verbatim.
    pub fn response_to(req: &Message, code: u16, reason: &str) -> Message {
        let mut resp = Message::response(code, reason);
        for h in req.headers.all(&HeaderName::Via) {
            resp.headers.push(h.name.clone(), h.value.clone());
        }
        for name in [
            HeaderName::From,
            HeaderName::To,
            HeaderName::CallId,
            HeaderName::Cseq,
        ] {
            if let Some(h) = req.headers.first(&name) {
                resp.headers.push(h.name.clone(), h.value.clone());
            }
        }
        resp.remote = req.remote.clone();
        resp
    }

    /// ACK for a non-2xx final INVITE response (RFC 3261 §17.1.1.3): the
    /// request URI, Call-ID, From, CSeq number and Route set come from the
    /// original request, the Via is exactly its topmost Via, and To is
    /// taken from the response so the tag survives.
    pub fn ack_for(req: &Message, resp: &Message) -> Result<Message, Error> {
        let uri = req.request_uri().ok_or(MessageError::NotRequest)?.clone();
        let mut ack = Message::request(Method::Ack, uri);
        let via = req
            .headers
            .first(&HeaderName::Via)
            .ok_or(MessageError::NoVia)?;
        ack.headers.push(via.name.clone(), via.value.clone());
        for h in req.headers.all(&HeaderName::Route) {
            ack.headers.push(h.name.clone(), h.value.clone());
        }
        for name in [HeaderName::MaxForwards, HeaderName::From] {
            if let Some(h) = req.headers.first(&name) {
                ack.headers.push(h.name.clone(), h.value.clone());
            }
        }
        if let Some(h) = resp.headers.first(&HeaderName::To) {
            ack.headers.push(h.name.clone(), h.value.clone());
        }
        if let Some(h) = req.headers.first(&HeaderName::CallId) {
            ack.headers.push(h.name.clone(), h.value.clone());
        }
        let seq = req.cseq()?.seq;
        ack.headers.push(
            HeaderName::Cseq,
            HeaderValue::Cseq(Cseq {
                seq,
                method: Method::Ack,
            }),
        );
        ack.remote = req.remote.clone();
        Ok(ack)
    }
}

impl FromStr for Message {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Message, MessageError> {
        parse_datagram(s.as_bytes())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.start {
            StartLine::Request { method, uri } => {
                write!(f, "{} {} SIP/2.0\r\n", method, uri)?;
            }
            StartLine::Response { code, reason } => {
                write!(f, "SIP/2.0 {} {}\r\n", code, reason)?;
            }
        }
        for h in self.headers.iter() {
            if h.name == HeaderName::ContentLength {
                continue;
            }
            write!(f, "{}\r\n", h)?;
        }
        match self.body.as_ref() {
            Some(b) => write!(f, "Content-Length: {}\r\n\r\n{}", b.len(), b),
            None => write!(f, "Content-Length: 0\r\n\r\n"),
        }
    }
}

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
        305 => "Use Proxy",
        380 => "Alternative Service",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        410 => "Gone",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Unsupported URI Scheme",
        420 => "Bad Extension",
        421 => "Extension Required",
        423 => "Interval Too Brief",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        482 => "Loop Detected",
        483 => "Too Many Hops",
        484 => "Address Incomplete",
        485 => "Ambiguous",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        491 => "Request Pending",
        493 => "Undecipherable",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Server Time-out",
        505 => "Version Not Supported",
        513 => "Message Too Large",
        600 => "Busy Everywhere",
        603 => "Decline",
        604 => "Does Not Exist Anywhere",
        606 => "Not Acceptable",
        _ => "Unknown",
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn framing_kind(data: &[u8]) -> MessageError {
    if data.starts_with(b"SIP/2.0 ") {
        MessageError::BadResponse
    } else {
        MessageError::BadRequest
    }
}

fn parse_start_line(line: &str) -> Result<StartLine, Error> {
    if line.starts_with("SIP/2.0") {
        let parts: Vec<&str> = line.splitn(3, ' ').collect();
        if parts.len() < 2 {
            Err(MessageError::InvalidStartLine)?;
        }
        let code = parts[1].parse::<u16>()?;
        if !(100..700).contains(&code) {
            Err(MessageError::InvalidStartLine)?;
        }
        Ok(StartLine::Response {
            code,
            reason: parts.get(2).unwrap_or(&"").to_string(),
        })
    } else {
        let parts: Vec<&str> = line.splitn(3, ' ').collect();
        if parts.len() != 3 || !parts[2].starts_with("SIP/") {
            Err(MessageError::InvalidStartLine)?;
        }
        let method = Method::from_str(parts[0])?;
        let uri = Uri::from_str(parts[1])?;
        Ok(StartLine::Request { method, uri })
    }
}

/// Split a header block into a start line and raw header entries.
/// Continuation lines (SP/HTAB) fold into the previous header with a single
/// space; comma-separated Via/Route/Record-Route/Contact lines are split
/// into individual entries so relative order is preserved.
fn parse_head(head: &str) -> Result<(StartLine, Headers), Error> {
    let mut logical: Vec<String> = Vec::new();
    for line in head.split("\r\n") {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(prev) = logical.last_mut() {
                let joined = format!("{} {}", prev.trim_end(), line.trim_start());
                *prev = joined;
            }
            continue;
        }
        logical.push(line.to_string());
    }

    let mut lines = logical.into_iter();
    let start =
        parse_start_line(&lines.next().ok_or(MessageError::InvalidStartLine)?)?;

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = match line.split_once(':') {
            Some(pair) => pair,
            None => continue,
        };
        let name = HeaderName::parse(name);
        let value = value.trim();
        if name.is_multi() {
            for item in abnf::split_list(value) {
                headers.push_raw(name.clone(), item.to_string());
            }
        } else {
            headers.push_raw(name, value.to_string());
        }
    }

    Ok((start, headers))
}

/// Frame a single message out of a datagram. Bytes past Content-Length are
/// discarded; a short body is an error; a missing Content-Length means the
/// body runs to the end of the datagram.
pub fn parse_datagram(buf: &[u8]) -> Result<Message, MessageError> {
    let mut data = buf;
    while data.starts_with(b"\r\n") {
        data = &data[2..];
    }
    let end = find(data, b"\r\n\r\n").ok_or_else(|| framing_kind(data))?;
    let head =
        std::str::from_utf8(&data[..end]).map_err(|_| framing_kind(data))?;
    let (start, headers) = parse_head(head).map_err(|_| framing_kind(data))?;
    let rest = &data[end + 4..];

    let body_bytes = match headers.typed(&HeaderName::ContentLength) {
        Ok(Some(HeaderValue::Int(n))) => {
            let n = n as usize;
            if rest.len() < n {
                return Err(MessageError::ContentTooSmall);
            }
            &rest[..n]
        }
        Ok(_) => rest,
        Err(_) => return Err(framing_kind(data)),
    };
    let body = if body_bytes.is_empty() {
        None
    } else {
        Some(
            String::from_utf8(body_bytes.to_vec())
                .map_err(|_| framing_kind(data))?,
        )
    };

    Ok(Message {
        start,
        headers,
        body,
        remote: None,
    })
}

enum StreamState {
    Before,
    Head,
    Body {
        start: StartLine,
        headers: Headers,
        need: usize,
    },
}

/// Incremental framer for stream transports. Accepts arbitrary byte chunks
/// and yields complete messages; state survives between calls so a message
/// may arrive one byte at a time. Any error is fatal for the connection.
pub struct StreamParser {
    buf: Vec<u8>,
    scanned: usize,
    state: StreamState,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> StreamParser {
        StreamParser {
            buf: Vec::new(),
            scanned: 0,
            state: StreamState::Before,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Message>, MessageError> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            match std::mem::replace(&mut self.state, StreamState::Before) {
                StreamState::Before => {
                    let mut n = 0;
                    while self.buf.len() >= n + 2
                        && self.buf[n] == b'\r'
                        && self.buf[n + 1] == b'\n'
                    {
                        n += 2;
                    }
                    if n > 0 {
                        self.buf.drain(..n);
                    }
                    if self.buf.is_empty()
                        || (self.buf.len() == 1 && self.buf[0] == b'\r')
                    {
                        self.state = StreamState::Before;
                        break;
                    }
                    self.scanned = 0;
                    self.state = StreamState::Head;
                }
                StreamState::Head => {
                    // the terminator may straddle chunks, so re-scan the
                    // last three bytes of what was already searched
                    let from = self.scanned.saturating_sub(3);
                    match find(&self.buf[from..], b"\r\n\r\n") {
                        Some(i) => {
                            let end = from + i;
                            let head = std::str::from_utf8(&self.buf[..end])
                                .map_err(|_| framing_kind(&self.buf))?;
                            let (start, headers) = parse_head(head)
                                .map_err(|_| framing_kind(&self.buf))?;
                            let need =
                                match headers.typed(&HeaderName::ContentLength)
                                {
                                    Ok(Some(HeaderValue::Int(n))) => n as usize,
                                    Ok(_) => {
                                        return Err(
                                            MessageError::NoContentLength,
                                        )
                                    }
                                    Err(_) => {
                                        return Err(framing_kind(&self.buf))
                                    }
                                };
                            self.buf.drain(..end + 4);
                            self.state = StreamState::Body {
                                start,
                                headers,
                                need,
                            };
                        }
                        None => {
                            self.scanned = self.buf.len();
                            self.state = StreamState::Head;
                            break;
                        }
                    }
                }
                StreamState::Body {
                    start,
                    headers,
                    need,
                } => {
                    if self.buf.len() < need {
                        self.state = StreamState::Body {
                            start,
                            headers,
                            need,
                        };
                        break;
                    }
                    let body_bytes: Vec<u8> = self.buf.drain(..need).collect();
                    let body = if body_bytes.is_empty() {
                        None
                    } else {
                        Some(String::from_utf8(body_bytes).map_err(|_| {
                            match &start {
                                StartLine::Response { .. } => {
                                    MessageError::BadResponse
                                }
                                StartLine::Request { .. } => {
                                    MessageError::BadRequest
                                }
                            }
                        })?)
                    };
                    out.push(Message {
                        start,
                        headers,
                        body,
                        remote: None,
                    });
                    self.state = StreamState::Before;
                }
            }
        }
        Ok(out)
    }
}
