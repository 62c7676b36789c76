//! Typed representation of the RFC 3261 header catalog. Each supported
//! header has a parser (wire text to typed value) and a formatter (typed
//! value back to wire text); values parsed off the wire stay raw until
//! something asks for the typed form.

use std::fmt;
use std::str::FromStr;

use anyhow::Error;
use indexmap::IndexMap;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::abnf;
use crate::message::MessageError;
use crate::transport::TransportType;
use crate::uri::Uri;

lazy_static! {
    static ref ADDRESS_REGEX: [Regex; 3] = [
        Regex::new(r#"^(?P<name>[a-zA-Z0-9\-\._\+\~ \t]*)<(?P<uri>[^>]+)>(?:;(?P<params>[^\?]*))?"#).unwrap(),
        Regex::new(r#"^(?:"(?P<name>[^"]+)")[ \t]*<(?P<uri>[^>]+)>(?:;(?P<params>[^\?]*))?"#).unwrap(),
        Regex::new(r#"^[ \t]*(?P<name>)(?P<uri>[^;]+)(?:;(?P<params>[^\?]*))?"#).unwrap(),
    ];
}

#[derive(Debug, PartialEq, Eq, Clone, Hash, Serialize, Deserialize)]
pub enum Method {
    Invite,
    Register,
    Cancel,
    Ack,
    Bye,
    Options,
    Subscribe,
    Notify,
    Refer,
    Info,
    Publish,
    Message,
    Update,
    Extension(String),
}

impl Default for Method {
    fn default() -> Self {
        Method::Invite
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "INVITE" => Method::Invite,
            "REGISTER" => Method::Register,
            "CANCEL" => Method::Cancel,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "OPTIONS" => Method::Options,
            "SUBSCRIBE" => Method::Subscribe,
            "NOTIFY" => Method::Notify,
            "REFER" => Method::Refer,
            "INFO" => Method::Info,
            "PUBLISH" => Method::Publish,
            "MESSAGE" => Method::Message,
            "UPDATE" => Method::Update,
            other => {
                if !abnf::is_token(other) {
                    Err(MessageError::InvalidStartLine)?;
                }
                Method::Extension(other.to_string())
            }
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Method::Invite => "INVITE",
            Method::Register => "REGISTER",
            Method::Cancel => "CANCEL",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Options => "OPTIONS",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Refer => "REFER",
            Method::Info => "INFO",
            Method::Publish => "PUBLISH",
            Method::Message => "MESSAGE",
            Method::Update => "UPDATE",
            Method::Extension(s) => s,
        })
    }
}

/// Header names. Comparison is on the canonical (lowercase) form; the
/// compact aliases of RFC 3261 §20 fold into the same variants on parse.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum HeaderName {
    Accept,
    AcceptEncoding,
    AcceptLanguage,
    AlertInfo,
    Allow,
    Authorization,
    CallId,
    CallInfo,
    Contact,
    ContentDisposition,
    ContentEncoding,
    ContentLanguage,
    ContentLength,
    ContentType,
    Cseq,
    Date,
    ErrorInfo,
    Expires,
    From,
    InReplyTo,
    MaxForwards,
    MimeVersion,
    MinExpires,
    Organization,
    Priority,
    ProxyAuthenticate,
    ProxyAuthorization,
    ProxyRequire,
    RecordRoute,
    ReplyTo,
    Require,
    RetryAfter,
    Route,
    Server,
    Subject,
    Supported,
    Timestamp,
    To,
    Unsupported,
    UserAgent,
    Via,
    Warning,
    WwwAuthenticate,
    Other(String),
}

impl HeaderName {
    pub fn parse(s: &str) -> HeaderName {
        use HeaderName::*;
        match s.trim().to_ascii_lowercase().as_str() {
            "accept" => Accept,
            "accept-encoding" => AcceptEncoding,
            "accept-language" => AcceptLanguage,
            "alert-info" => AlertInfo,
            "allow" => Allow,
            "authorization" => Authorization,
            "i" | "call-id" => CallId,
            "call-info" => CallInfo,
            "m" | "contact" => Contact,
            "content-disposition" => ContentDisposition,
            "e" | "content-encoding" => ContentEncoding,
            "content-language" => ContentLanguage,
            "l" | "content-length" => ContentLength,
            "c" | "content-type" => ContentType,
            "cseq" => Cseq,
            "date" => Date,
            "error-info" => ErrorInfo,
            "expires" => Expires,
            "f" | "from" => From,
            "in-reply-to" => InReplyTo,
            "max-forwards" => MaxForwards,
            "mime-version" => MimeVersion,
            "min-expires" => MinExpires,
            "organization" => Organization,
            "priority" => Priority,
            "proxy-authenticate" => ProxyAuthenticate,
            "proxy-authorization" => ProxyAuthorization,
            "proxy-require" => ProxyRequire,
            "record-route" => RecordRoute,
            "reply-to" => ReplyTo,
            "require" => Require,
            "retry-after" => RetryAfter,
            "route" => Route,
            "server" => Server,
            "s" | "subject" => Subject,
            "k" | "supported" => Supported,
            "timestamp" => Timestamp,
            "t" | "to" => To,
            "unsupported" => Unsupported,
            "user-agent" => UserAgent,
            "v" | "via" => Via,
            "warning" => Warning,
            "www-authenticate" => WwwAuthenticate,
            other => Other(other.to_string()),
        }
    }

    /// Headers whose relative order is semantically meaningful and whose
    /// comma-separated occurrences are split into individual entries.
    pub fn is_multi(&self) -> bool {
        matches!(
            self,
            HeaderName::Via
                | HeaderName::Route
                | HeaderName::RecordRoute
                | HeaderName::Contact
        )
    }
}

impl fmt::Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use HeaderName::*;
        let name = match self {
            Accept => "Accept",
            AcceptEncoding => "Accept-Encoding",
            AcceptLanguage => "Accept-Language",
            AlertInfo => "Alert-Info",
            Allow => "Allow",
            Authorization => "Authorization",
            CallId => "Call-ID",
            CallInfo => "Call-Info",
            Contact => "Contact",
            ContentDisposition => "Content-Disposition",
            ContentEncoding => "Content-Encoding",
            ContentLanguage => "Content-Language",
            ContentLength => "Content-Length",
            ContentType => "Content-Type",
            Cseq => "CSeq",
            Date => "Date",
            ErrorInfo => "Error-Info",
            Expires => "Expires",
            From => "From",
            InReplyTo => "In-Reply-To",
            MaxForwards => "Max-Forwards",
            MimeVersion => "MIME-Version",
            MinExpires => "Min-Expires",
            Organization => "Organization",
            Priority => "Priority",
            ProxyAuthenticate => "Proxy-Authenticate",
            ProxyAuthorization => "Proxy-Authorization",
            ProxyRequire => "Proxy-Require",
            RecordRoute => "Record-Route",
            ReplyTo => "Reply-To",
            Require => "Require",
            RetryAfter => "Retry-After",
            Route => "Route",
            Server => "Server",
            Subject => "Subject",
            Supported => "Supported",
            Timestamp => "Timestamp",
            To => "To",
            Unsupported => "Unsupported",
            UserAgent => "User-Agent",
            Via => "Via",
            Warning => "Warning",
            WwwAuthenticate => "WWW-Authenticate",
            Other(s) => {
                // unknown names print capitalized on each dash boundary
                let mut upper = true;
                for c in s.chars() {
                    let c = if upper { c.to_ascii_uppercase() } else { c };
                    upper = c == '-';
                    write!(f, "{}", c)?;
                }
                return Ok(());
            }
        };
        f.write_str(name)
    }
}

#[derive(Default, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Cseq {
    pub seq: u32,
    pub method: Method,
}

impl FromStr for Cseq {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(2, ' ').collect();
        if parts.len() != 2 {
            Err(MessageError::InvalidHeader("CSeq"))?;
        }
        let seq = parts[0].parse::<u32>()?;
        let method = Method::from_str(parts[1].trim())?;
        Ok(Cseq { seq, method })
    }
}

impl fmt::Display for Cseq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

#[derive(Default, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Via {
    pub version: String,
    pub transport: TransportType,
    pub host: String,
    pub port: Option<u16>,
    pub branch: String,
    pub received: Option<String>,
    pub rport: Option<u16>,
    pub params: IndexMap<String, Option<String>>,
}

impl FromStr for Via {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut via = Via::default();
        let parts: Vec<&str> = s.splitn(2, ' ').collect();
        if parts.len() != 2 {
            Err(MessageError::InvalidVia)?;
        }

        let proto = parts[0];
        let addr = parts[1].trim();

        let parts: Vec<&str> = proto.split('/').collect();
        if parts.len() != 3 || parts[0] != "SIP" {
            Err(MessageError::InvalidVia)?;
        }
        via.version = parts[1].to_string();
        via.transport = TransportType::from_str(&parts[2].to_lowercase())?;

        let uri = Uri::from_str(&["sip:", addr].concat())?;
        via.host = uri.host;
        via.port = uri.port;
        for (key, value) in uri.params {
            match key.as_ref() {
                "branch" => via.branch = value.unwrap_or_default(),
                "received" => via.received = value,
                "rport" => {
                    via.rport = value.and_then(|r| r.parse::<u16>().ok());
                }
                _ => {
                    via.params.insert(key, value);
                }
            }
        }

        Ok(via)
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "SIP/{}/{} ",
            if self.version.is_empty() {
                "2.0"
            } else {
                &self.version
            },
            self.transport.to_string().to_uppercase(),
        )?;
        if abnf::is_ipv6(&self.host) {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }

        if let Some(ref p) = self.port {
            write!(f, ":{}", p)?;
        }

        if let Some(ref r) = self.received {
            write!(f, ";received={}", r)?;
        }

        if let Some(ref r) = self.rport {
            write!(f, ";rport={}", r)?;
        }

        write!(f, ";branch={}", self.branch)?;

        for (key, val) in self.params.iter() {
            f.write_str(";")?;
            f.write_str(key)?;
            if let Some(inner) = val {
                write!(f, "={}", inner)?;
            }
        }

        Ok(())
    }
}

#[derive(Default, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Address {
    pub display_name: String,
    pub uri: Uri,
    pub tag: Option<String>,
    pub params: IndexMap<String, Option<String>>,
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        for re in ADDRESS_REGEX.iter() {
            let mut captures = re.captures_iter(s);
            if let Some(cap) = captures.next() {
                if cap.len() != 4 {
                    continue;
                }

                let display_name = cap
                    .name("name")
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default();
                let uri = Uri::from_str(
                    cap.name("uri").ok_or(MessageError::InvalidUri)?.as_str(),
                )?;

                let mut address = Address {
                    display_name,
                    uri,
                    tag: None,
                    params: IndexMap::new(),
                };

                if let Some(m) = cap.name("params") {
                    for part in m.as_str().split(';') {
                        let mut split = part.splitn(2, '=');
                        let name = split.next().unwrap_or("").trim();
                        if name.is_empty() {
                            continue;
                        }
                        let value = split.next().map(|i| i.trim().to_string());
                        if name.eq_ignore_ascii_case("tag") {
                            address.tag = value;
                        } else {
                            address.params.insert(name.to_string(), value);
                        }
                    }
                }

                return Ok(address);
            }
        }
        Err(MessageError::InvalidAddress)?
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if !self.display_name.is_empty() {
            write!(f, r#""{}" "#, self.display_name)?;
        }

        write!(f, "<{}>", self.uri)?;

        if let Some(ref t) = self.tag {
            write!(f, ";tag={}", t)?;
        }

        for (key, val) in self.params.iter() {
            f.write_str(";")?;
            f.write_str(key)?;
            if let Some(inner) = val {
                write!(f, "={}", abnf::param_value(inner))?;
            }
        }

        Ok(())
    }
}

impl Address {
    pub fn new(uri: Uri) -> Address {
        Address {
            uri,
            ..Default::default()
        }
    }

    /// Contact q-value, defaulting to 1.0 when absent or malformed.
    pub fn q(&self) -> f32 {
        self.params
            .get("q")
            .and_then(|v| v.as_ref())
            .and_then(|v| v.parse::<f32>().ok())
            .unwrap_or(1.0)
    }
}

/// An authentication credential or challenge: a scheme plus its ordered
/// parameter list. Values are stored unquoted.
#[derive(Default, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Auth {
    pub scheme: String,
    pub params: IndexMap<String, String>,
}

impl FromStr for Auth {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (scheme, rest) = s
            .split_once(' ')
            .ok_or(MessageError::InvalidHeader("authorization"))?;
        let mut auth = Auth {
            scheme: scheme.to_string(),
            params: IndexMap::new(),
        };
        for part in abnf::split_list(rest) {
            let mut split = part.splitn(2, '=');
            let name = split.next().unwrap_or("").trim();
            if name.is_empty() {
                continue;
            }
            let value = abnf::unquote(split.next().unwrap_or(""));
            auth.params.insert(name.to_ascii_lowercase(), value);
        }
        Ok(auth)
    }
}

impl fmt::Display for Auth {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ", self.scheme)?;
        let mut first = true;
        for (key, value) in self.params.iter() {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            let bare = matches!(
                key.as_str(),
                "algorithm" | "stale" | "nc" | "qop"
            ) && abnf::is_token(value);
            if bare {
                write!(f, "{}={}", key, value)?;
            } else {
                write!(f, "{}={}", key, abnf::quote(value))?;
            }
        }
        Ok(())
    }
}

impl Auth {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }
}

#[derive(Default, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MediaType {
    pub r#type: String,
    pub subtype: String,
    pub params: IndexMap<String, String>,
}

impl MediaType {
    pub fn new(t: &str, sub: &str) -> MediaType {
        MediaType {
            r#type: t.to_string(),
            subtype: sub.to_string(),
            params: IndexMap::new(),
        }
    }
}

impl FromStr for MediaType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(';');
        let mt = parts.next().unwrap_or("").trim();
        let (t, sub) = mt
            .split_once('/')
            .ok_or(MessageError::InvalidHeader("content-type"))?;
        let mut media = MediaType::new(t.trim(), sub.trim());
        for part in parts {
            let mut split = part.splitn(2, '=');
            let name = split.next().unwrap_or("").trim();
            if name.is_empty() {
                continue;
            }
            let value = abnf::unquote(split.next().unwrap_or("").trim());
            media.params.insert(name.to_ascii_lowercase(), value);
        }
        Ok(media)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.r#type, self.subtype)?;
        for (key, value) in self.params.iter() {
            write!(f, ";{}={}", key, abnf::param_value(value))?;
        }
        Ok(())
    }
}

/// The value side of a header entry. Wire input lands as `Raw` and is
/// upgraded on demand; programmatic construction uses the typed variants.
#[derive(Clone, Debug, PartialEq)]
pub enum HeaderValue {
    Raw(String),
    Address(Address),
    Addresses(Vec<Address>),
    Via(Vec<Via>),
    Cseq(Cseq),
    Int(u32),
    Methods(Vec<Method>),
    Tokens(Vec<String>),
    MediaType(MediaType),
    MediaTypes(Vec<MediaType>),
    Auth(Auth),
    Text(String),
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fn join<T: fmt::Display>(
            f: &mut fmt::Formatter,
            items: &[T],
        ) -> fmt::Result {
            let mut first = true;
            for item in items {
                if !first {
                    f.write_str(", ")?;
                }
                first = false;
                write!(f, "{}", item)?;
            }
            Ok(())
        }

        match self {
            HeaderValue::Raw(s) | HeaderValue::Text(s) => f.write_str(s),
            HeaderValue::Address(a) => write!(f, "{}", a),
            HeaderValue::Addresses(items) => join(f, items),
            HeaderValue::Via(items) => join(f, items),
            HeaderValue::Cseq(c) => write!(f, "{}", c),
            HeaderValue::Int(i) => write!(f, "{}", i),
            HeaderValue::Methods(items) => join(f, items),
            HeaderValue::Tokens(items) => join(f, items),
            HeaderValue::MediaType(m) => write!(f, "{}", m),
            HeaderValue::MediaTypes(items) => join(f, items),
            HeaderValue::Auth(a) => write!(f, "{}", a),
        }
    }
}

/// Parse a raw header value into its typed form per the header's grammar.
/// Unknown headers come back as opaque text.
pub fn parse_value(
    name: &HeaderName,
    raw: &str,
) -> Result<HeaderValue, Error> {
    use HeaderName::*;
    let raw = raw.trim();
    Ok(match name {
        Via => HeaderValue::Via(
            abnf::split_list(raw)
                .into_iter()
                .map(self::Via::from_str)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        From | To => HeaderValue::Address(Address::from_str(raw)?),
        Contact | Route | RecordRoute | ReplyTo | AlertInfo | CallInfo
        | ErrorInfo => HeaderValue::Addresses(
            abnf::split_list(raw)
                .into_iter()
                .map(Address::from_str)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Cseq => HeaderValue::Cseq(self::Cseq::from_str(raw)?),
        ContentLength | MaxForwards | Expires | MinExpires | RetryAfter => {
            HeaderValue::Int(raw.parse::<u32>()?)
        }
        Allow => HeaderValue::Methods(
            abnf::split_list(raw)
                .into_iter()
                .map(Method::from_str)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Require | Supported | Unsupported | ProxyRequire | ContentEncoding
        | AcceptEncoding | AcceptLanguage | ContentLanguage | InReplyTo => {
            HeaderValue::Tokens(
                abnf::split_list(raw)
                    .into_iter()
                    .map(|t| t.to_string())
                    .collect(),
            )
        }
        ContentType => HeaderValue::MediaType(MediaType::from_str(raw)?),
        Accept => HeaderValue::MediaTypes(
            abnf::split_list(raw)
                .into_iter()
                .map(MediaType::from_str)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Authorization | ProxyAuthorization | WwwAuthenticate
        | ProxyAuthenticate => HeaderValue::Auth(Auth::from_str(raw)?),
        _ => HeaderValue::Text(raw.to_string()),
    })
}

#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    pub name: HeaderName,
    pub value: HeaderValue,
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// The ordered header sequence of a message.
#[derive(Default, Clone, Debug, PartialEq)]
pub struct Headers {
    items: Vec<Header>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers::default()
    }

    pub fn push(&mut self, name: HeaderName, value: HeaderValue) {
        self.items.push(Header { name, value });
    }

    pub fn push_raw(&mut self, name: HeaderName, raw: String) {
        self.push(name, HeaderValue::Raw(raw));
    }

    /// Replace the first occurrence (or append), dropping any duplicates.
    pub fn set(&mut self, name: HeaderName, value: HeaderValue) {
        match self.items.iter().position(|h| h.name == name) {
            Some(i) => {
                self.items[i].value = value;
                let mut seen = 0;
                self.items.retain(|h| {
                    if h.name == name {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.push(name, value),
        }
    }

    pub fn remove(&mut self, name: &HeaderName) {
        self.items.retain(|h| &h.name != name);
    }

    pub fn contains(&self, name: &HeaderName) -> bool {
        self.items.iter().any(|h| &h.name == name)
    }

    pub fn first(&self, name: &HeaderName) -> Option<&Header> {
        self.items.iter().find(|h| &h.name == name)
    }

    pub fn all<'a>(
        &'a self,
        name: &'a HeaderName,
    ) -> impl Iterator<Item = &'a Header> {
        self.items.iter().filter(move |h| &h.name == name)
    }

    /// Typed view of the first occurrence, parsing a raw value on demand.
    pub fn typed(
        &self,
        name: &HeaderName,
    ) -> Result<Option<HeaderValue>, Error> {
        match self.first(name) {
            None => Ok(None),
            Some(h) => Ok(Some(match &h.value {
                HeaderValue::Raw(raw) => parse_value(name, raw)?,
                v => v.clone(),
            })),
        }
    }

    /// Typed view of every occurrence, in order.
    pub fn typed_all(
        &self,
        name: &HeaderName,
    ) -> Result<Vec<HeaderValue>, Error> {
        self.all(name)
            .map(|h| match &h.value {
                HeaderValue::Raw(raw) => parse_value(name, raw),
                v => Ok(v.clone()),
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn via_from_string() {
        let s = "SIP/2.0/UDP 10.0.0.2;branch=testbranch";
        let via = Via::from_str(s).unwrap();
        assert_eq!(s, via.to_string());

        let s = "SIP/2.0/UDP 10.0.0.2:5080;received=10.0.0.3;rport=5090;branch=testbranch";
        let via = Via::from_str(s).unwrap();
        assert_eq!(s, via.to_string());
        assert_eq!("10.0.0.3", via.received.unwrap());
        assert_eq!(5090, via.rport.unwrap());
    }

    #[test]
    fn via_to_string() {
        let via = Via {
            host: "10.0.0.2".to_string(),
            branch: "testbranch".to_string(),
            ..Default::default()
        };
        assert_eq!("SIP/2.0/UDP 10.0.0.2;branch=testbranch", via.to_string());

        let via = Via {
            host: "10.0.0.2".to_string(),
            port: Some(5080),
            received: Some("10.0.0.3".to_string()),
            rport: Some(5090),
            branch: "testbranch".to_string(),
            ..Default::default()
        };
        assert_eq!(
            "SIP/2.0/UDP 10.0.0.2:5080;received=10.0.0.3;rport=5090;branch=testbranch",
            via.to_string()
        );
    }

    #[test]
    fn address_from_string() {
        let s = r#""Test Address" <sip:test@example.net>;tag=tag"#;
        let address = Address::from_str(s).unwrap();
        assert_eq!(s, address.to_string());
        assert_eq!("tag", address.tag.unwrap_or_default());

        let s = r#"Test Address<sip:test@example.net>;tag=tag"#;
        let address = Address::from_str(s).unwrap();
        assert_eq!(
            r#""Test Address" <sip:test@example.net>;tag=tag"#,
            address.to_string()
        );

        let s = r#"sip:test@example.net"#;
        let address = Address::from_str(s).unwrap();
        assert_eq!("<sip:test@example.net>", address.to_string());

        let s = "<sip:x@a.invalid;transport=tcp>;q=0.6";
        let address = Address::from_str(s).unwrap();
        assert_eq!(Some(TransportType::Tcp), address.uri.transport);
        assert!((address.q() - 0.6).abs() < f32::EPSILON);
        assert_eq!(s, address.to_string());
    }

    #[test]
    fn header_name_aliases() {
        assert_eq!(HeaderName::Via, HeaderName::parse("v"));
        assert_eq!(HeaderName::Via, HeaderName::parse("VIA"));
        assert_eq!(HeaderName::CallId, HeaderName::parse("i"));
        assert_eq!(HeaderName::Contact, HeaderName::parse("M"));
        assert_eq!(HeaderName::Supported, HeaderName::parse("k"));
        assert_eq!(HeaderName::ContentType, HeaderName::parse("c"));
        assert_eq!("Call-ID", HeaderName::CallId.to_string());
        assert_eq!("WWW-Authenticate", HeaderName::WwwAuthenticate.to_string());
        assert_eq!(
            "X-Custom-Header",
            HeaderName::parse("x-custom-header").to_string()
        );
    }

    #[test]
    fn auth_round_trip() {
        let s = r#"Digest realm="atlanta.com", nonce="84a4cc6f", opaque="", algorithm=MD5"#;
        let auth = Auth::from_str(s).unwrap();
        assert_eq!("Digest", auth.scheme);
        assert_eq!(Some("atlanta.com"), auth.get("realm"));
        assert_eq!(Some("84a4cc6f"), auth.get("nonce"));
        assert_eq!(Some("MD5"), auth.get("algorithm"));
        assert_eq!(s, auth.to_string());
        let reparsed = Auth::from_str(&auth.to_string()).unwrap();
        assert_eq!(auth, reparsed);
    }

    #[test]
    fn media_type_round_trip() {
        let m = MediaType::from_str("application/sdp").unwrap();
        assert_eq!("application/sdp", m.to_string());

        let m = MediaType::from_str("text/html; charset=ISO-8859-4").unwrap();
        assert_eq!("ISO-8859-4", m.params["charset"]);
        assert_eq!("text/html;charset=ISO-8859-4", m.to_string());
    }

    #[test]
    fn typed_parse_round_trip() {
        let cases: Vec<(HeaderName, &str)> = vec![
            (HeaderName::Via, "SIP/2.0/UDP 10.0.0.2:5080;branch=z9hG4bKx"),
            (HeaderName::From, r#""A" <sip:a@x.com>;tag=1928301774"#),
            (HeaderName::Cseq, "314159 INVITE"),
            (HeaderName::ContentLength, "142"),
            (HeaderName::Allow, "INVITE, ACK, CANCEL, OPTIONS, BYE"),
            (HeaderName::Supported, "replaces, timer"),
            (HeaderName::ContentType, "application/sdp"),
            (
                HeaderName::Contact,
                "<sip:x@a>;q=0.6, <sip:y@b>;q=0.9",
            ),
            (
                HeaderName::WwwAuthenticate,
                r#"Digest realm="x", nonce="n""#,
            ),
        ];
        for (name, raw) in cases {
            let typed = parse_value(&name, raw).unwrap();
            let formatted = typed.to_string();
            let reparsed = parse_value(&name, &formatted).unwrap();
            assert_eq!(typed, reparsed, "header {name} failed round trip");
        }
    }

    #[test]
    fn multiple_occurrences_equal_comma_join() {
        let joined = parse_value(
            &HeaderName::Via,
            "SIP/2.0/UDP a;branch=b1, SIP/2.0/TCP b;branch=b2",
        )
        .unwrap();
        match joined {
            HeaderValue::Via(vias) => {
                assert_eq!(2, vias.len());
                assert_eq!("b1", vias[0].branch);
                assert_eq!("b2", vias[1].branch);
            }
            other => panic!("unexpected value {other:?}"),
        }
    }
}
