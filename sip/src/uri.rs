use std::fmt;
use std::str::FromStr;

use anyhow::Error;
use indexmap::IndexMap;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::abnf;
use crate::message::MessageError;
use crate::transport::TransportType;

lazy_static! {
    static ref URI_REGEX: Regex = Regex::new(
        [
            r"^(?P<scheme>[a-zA-Z][a-zA-Z0-9\+\-\.]*):",
            r"(?:(?:(?P<user>[a-zA-Z0-9\-_\.!\~\*\#'\(\)&=\+\$,;\?/%]+)",
            r"(?::(?P<password>[^:@;\?]+))?)@)?",
            r"(?:\[(?P<host6>[^\]]+)\]|(?P<host>[^;\?:]*))(?::(?P<port>[\d]+))?",
            r"(?:;(?P<params>[^\?]*))?",
            r"(?:\?(?P<headers>.*))?$",
        ]
        .concat()
        .as_ref(),
    )
    .unwrap();
}

/// A SIP, SIPS or TEL URI. Known parameters get their own fields; extension
/// parameters keep their relative order. A `tel:` URI carries the subscriber
/// string in `host` with no user part.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Uri {
    pub scheme: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub transport: Option<TransportType>,
    pub user_param: Option<String>,
    pub method: Option<String>,
    pub ttl: Option<u8>,
    pub maddr: Option<String>,
    pub lr: bool,
    pub params: IndexMap<String, Option<String>>,
    pub headers: IndexMap<String, String>,
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut uri = Uri::default();
        let caps = URI_REGEX.captures(s).ok_or(MessageError::InvalidUri)?;
        if let Some(m) = caps.name("scheme") {
            uri.scheme = m.as_str().to_string();
        }
        if let Some(m) = caps.name("user") {
            uri.user = Some(m.as_str().to_string());
        }
        if let Some(m) = caps.name("password") {
            uri.password = Some(m.as_str().to_string());
        }
        if let Some(m) = caps.name("host6") {
            uri.host = m.as_str().to_string();
        } else if let Some(m) = caps.name("host") {
            uri.host = m.as_str().to_string();
        }
        if let Some(m) = caps.name("port") {
            uri.port = Some(m.as_str().parse::<u16>()?);
        }

        if let Some(m) = caps.name("params") {
            for p in m.as_str().split(';') {
                let mut parts = p.splitn(2, '=');
                let name =
                    parts.next().unwrap_or("").trim().to_ascii_lowercase();
                if name.is_empty() {
                    continue;
                }
                let value = parts.next().map(|i| i.trim().to_string());
                match name.as_str() {
                    "transport" => {
                        uri.transport = Some(TransportType::from_str(
                            &value.unwrap_or_else(|| "udp".to_string()),
                        )?);
                    }
                    "user" => uri.user_param = value,
                    "method" => uri.method = value,
                    "ttl" => {
                        uri.ttl = value.and_then(|v| v.parse::<u8>().ok());
                    }
                    "maddr" => uri.maddr = value,
                    "lr" => uri.lr = true,
                    _ => {
                        uri.params.insert(name, value);
                    }
                };
            }
        }

        if let Some(m) = caps.name("headers") {
            for (k, v) in form_urlencoded::parse(m.as_str().as_bytes()) {
                uri.headers.insert(k.to_string(), v.to_string());
            }
        }

        Ok(uri)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:",
            if !self.scheme.is_empty() {
                &self.scheme
            } else {
                "sip"
            }
        )?;
        if let Some(ref u) = self.user {
            write!(f, "{}@", u)?;
        }
        if abnf::is_ipv6(&self.host) {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(ref p) = self.port {
            write!(f, ":{}", p)?;
        }

        if let Some(ref t) = self.transport {
            write!(f, ";transport={}", t.to_string().to_lowercase())?;
        }
        if let Some(ref u) = self.user_param {
            write!(f, ";user={}", u)?;
        }
        if let Some(ref m) = self.method {
            write!(f, ";method={}", m)?;
        }
        if let Some(ref t) = self.ttl {
            write!(f, ";ttl={}", t)?;
        }
        if let Some(ref m) = self.maddr {
            write!(f, ";maddr={}", m)?;
        }
        if self.lr {
            write!(f, ";lr")?;
        }

        for (key, val) in self.params.iter() {
            f.write_str(";")?;
            f.write_str(key.as_str())?;
            if let Some(inner) = val {
                f.write_str("=")?;
                f.write_str(inner.as_str())?;
            }
        }

        let mut encoded = form_urlencoded::Serializer::new(String::new());
        for (k, v) in self.headers.iter() {
            encoded.append_pair(k, v);
        }
        let encoded = encoded.finish();
        if !encoded.is_empty() {
            f.write_str("?")?;
            f.write_str(&encoded)?;
        }

        Ok(())
    }
}

fn both_or_equal<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => x == y,
        (None, None) => true,
        _ => false,
    }
}

/// RFC 3261 §19.1.4 equality. Scheme and host compare case-insensitively,
/// user and password case-sensitively. The user, ttl, method and maddr
/// parameters must agree in presence and value; transport and extension
/// parameters only need to match when both URIs carry them; header
/// components must match exactly.
impl PartialEq for Uri {
    fn eq(&self, other: &Self) -> bool {
        if !self.scheme.eq_ignore_ascii_case(&other.scheme)
            || self.user != other.user
            || self.password != other.password
            || !self.host.eq_ignore_ascii_case(&other.host)
            || self.port != other.port
        {
            return false;
        }
        if !both_or_equal(&self.user_param, &other.user_param)
            || !both_or_equal(&self.method, &other.method)
            || !both_or_equal(&self.ttl, &other.ttl)
            || !both_or_equal(&self.maddr, &other.maddr)
        {
            return false;
        }
        if let (Some(a), Some(b)) = (&self.transport, &other.transport) {
            if a != b {
                return false;
            }
        }
        for (k, v) in self.params.iter() {
            if let Some(ov) = other.params.get(k) {
                let matches = match (v, ov) {
                    (Some(x), Some(y)) => x.eq_ignore_ascii_case(y),
                    (None, None) => true,
                    _ => false,
                };
                if !matches {
                    return false;
                }
            }
        }
        if self.headers.len() != other.headers.len() {
            return false;
        }
        for (k, v) in self.headers.iter() {
            match other
                .headers
                .iter()
                .find(|(ok, _)| ok.eq_ignore_ascii_case(k))
            {
                Some((_, ov)) if ov == v => {}
                _ => return false,
            }
        }
        true
    }
}

impl Eq for Uri {}

impl Uri {
    pub fn sip(user: Option<&str>, host: &str) -> Uri {
        Uri {
            scheme: "sip".to_string(),
            user: user.map(|u| u.to_string()),
            host: host.to_string(),
            ..Default::default()
        }
    }

    pub fn is_sips(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("sips")
    }

    pub fn default_port(&self) -> u16 {
        if self.is_sips() || self.transport == Some(TransportType::Tls) {
            5061
        } else {
            5060
        }
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or_else(|| self.default_port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_from_string() {
        let s = "sip:test@test.com:5080;transport=tcp;lr;user=phone";
        let uri = Uri::from_str(s).unwrap();
        assert_eq!(Some(TransportType::Tcp), uri.transport);
        assert!(uri.lr);
        assert_eq!(Some("phone".to_string()), uri.user_param);
        assert_eq!(
            "sip:test@test.com:5080;transport=tcp;user=phone;lr",
            uri.to_string()
        );

        let s = "sip:test@test.com:5080";
        let uri = Uri::from_str(s).unwrap();
        assert_eq!("sip".to_string(), uri.scheme);
        assert_eq!(Some("test".to_string()), uri.user);
        assert_eq!("test.com".to_string(), uri.host);
        assert_eq!(Some(5080), uri.port);
        assert_eq!(s, uri.to_string());

        let s = "sip:#617@test.com";
        let uri = Uri::from_str(s).unwrap();
        assert_eq!(Some("#617".to_string()), uri.user);
        assert_eq!(s, uri.to_string());

        let s = "sips:test@test.com;lr";
        let uri = Uri::from_str(s).unwrap();
        assert_eq!(s, uri.to_string());
        assert_eq!(5061, uri.port_or_default());

        let s = "sip:alice@[2001:db8::1]:5062";
        let uri = Uri::from_str(s).unwrap();
        assert_eq!("2001:db8::1", uri.host);
        assert_eq!(Some(5062), uri.port);
        assert_eq!(s, uri.to_string());

        let s = "tel:4012";
        let uri = Uri::from_str(s).unwrap();
        assert_eq!("tel", uri.scheme);
        assert_eq!("4012", uri.host);
        assert_eq!(s, uri.to_string());

        let s = "sip:test@test.com;maddr=239.255.255.1;ttl=15";
        let uri = Uri::from_str(s).unwrap();
        assert_eq!(Some("239.255.255.1".to_string()), uri.maddr);
        assert_eq!(Some(15), uri.ttl);
        assert_eq!("sip:test@test.com;ttl=15;maddr=239.255.255.1", uri.to_string());
    }

    #[test]
    fn uri_headers_round_trip() {
        let s = "sip:4012@ansible.test.com?Replaces=abc%3Bto-tag%3Dx";
        let uri = Uri::from_str(s).unwrap();
        assert_eq!(Some(&"abc;to-tag=x".to_string()), uri.headers.get("Replaces"));
        assert_eq!(s, uri.to_string());
    }

    #[test]
    fn equality_rules() {
        let a = Uri::from_str("sip:alice@AtLanTa.CoM;Transport=udp").unwrap();
        let b = Uri::from_str("sip:alice@atlanta.com;transport=UDP").unwrap();
        assert_eq!(a, b);

        // user part is case-sensitive
        let a = Uri::from_str("sip:Alice@atlanta.com").unwrap();
        let b = Uri::from_str("sip:alice@atlanta.com").unwrap();
        assert_ne!(a, b);

        // transport in only one of the two still matches
        let a = Uri::from_str("sip:carol@chicago.com").unwrap();
        let b = Uri::from_str("sip:carol@chicago.com;transport=tcp").unwrap();
        assert_eq!(a, b);

        // method in only one never matches
        let a = Uri::from_str("sip:carol@chicago.com").unwrap();
        let b = Uri::from_str("sip:carol@chicago.com;method=INVITE").unwrap();
        assert_ne!(a, b);

        // differing header components never match
        let a = Uri::from_str("sip:bob@biloxi.com?priority=urgent").unwrap();
        let b = Uri::from_str("sip:bob@biloxi.com").unwrap();
        assert_ne!(a, b);

        // explicit port differs from no port
        let a = Uri::from_str("sip:bob@biloxi.com:5060").unwrap();
        let b = Uri::from_str("sip:bob@biloxi.com").unwrap();
        assert_ne!(a, b);
    }
}
