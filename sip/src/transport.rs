use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_channel::Sender;
use serde::{Deserialize, Serialize};
use strum_macros::{self, EnumString};
use thiserror::Error;

use crate::config::Config;
use crate::message::Message;
use crate::tcp::TcpTransport;
use crate::tls::TlsTransport;
use crate::udp::UdpTransport;
use crate::uri::Uri;

#[derive(
    strum_macros::Display,
    EnumString,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Clone,
    Deserialize,
    Serialize,
)]
#[strum(ascii_case_insensitive)]
pub enum TransportType {
    #[strum(serialize = "udp")]
    Udp,
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "tls")]
    Tls,
    #[strum(serialize = "sctp")]
    Sctp,
}

impl Default for TransportType {
    fn default() -> Self {
        TransportType::Udp
    }
}

impl TransportType {
    /// Stream transports deliver reliably; the retransmit timers only run
    /// over UDP.
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportType::Udp)
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportType::Tls => 5061,
            _ => 5060,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport {0} not supported")]
    NoTransport(String),
    #[error("message has no remote endpoint")]
    NoRemote,
    #[error("transport not bound")]
    NotBound,
}

/// A resolved peer endpoint: where a message came from or is headed.
#[derive(Default, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Remote {
    pub host: String,
    pub ip: String,
    pub port: u16,
    pub transport: TransportType,
}

impl Remote {
    pub fn from_peer(addr: &SocketAddr, transport: TransportType) -> Remote {
        Remote {
            host: addr.ip().to_string(),
            ip: addr.ip().to_string(),
            port: addr.port(),
            transport,
        }
    }

    /// Dialable `ip:port` form, bracketing IPv6 addresses.
    pub fn addr(&self) -> String {
        let ip = if self.ip.is_empty() {
            &self.host
        } else {
            &self.ip
        };
        if crate::abnf::is_ipv6(ip) {
            format!("[{}]:{}", ip, self.port)
        } else {
            format!("{}:{}", ip, self.port)
        }
    }
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.transport, self.addr())
    }
}

pub struct TransportManager {
    pub transports: HashMap<TransportType, Transport>,
    config: Arc<Config>,
}

impl TransportManager {
    pub fn new(msg_sender: Sender<Message>, config: Arc<Config>) -> Self {
        let mut transports = HashMap::new();
        transports.insert(
            TransportType::Udp,
            Transport::Udp(UdpTransport::new(msg_sender.clone(), config.clone())),
        );
        transports.insert(
            TransportType::Tcp,
            Transport::Tcp(TcpTransport::new(msg_sender.clone(), config.clone())),
        );
        transports.insert(
            TransportType::Tls,
            Transport::Tls(TlsTransport::new(msg_sender, config.clone())),
        );
        TransportManager { transports, config }
    }

    pub async fn listen(&self) -> Result<()> {
        for trans in self.transports.values() {
            trans.listen().await?;
        }
        Ok(())
    }

    pub async fn send(&self, msg: &Message) -> Result<()> {
        let remote = msg
            .remote
            .as_ref()
            .ok_or(TransportError::NoRemote)?
            .clone();
        let trans = self.transports.get(&remote.transport).ok_or_else(|| {
            TransportError::NoTransport(remote.transport.to_string())
        })?;
        trans.send(msg.to_string(), &remote).await
    }

    pub async fn local_uri(&self, trans: &TransportType) -> Result<Uri> {
        let trans = self.transports.get(trans).ok_or_else(|| {
            TransportError::NoTransport(trans.to_string())
        })?;
        trans.local_uri().await
    }

    /// Produce the ordered destination list for a request per RFC 3263,
    /// within the A/AAAA-only resolver contract: an explicit `transport`
    /// parameter wins, `sips` forces TLS, and otherwise the message size
    /// picks UDP or a congestion-controlled transport. The `maddr`
    /// parameter overrides the host for the lookup.
    pub async fn select_destinations(
        &self,
        msg: &Message,
    ) -> Result<Vec<Remote>> {
        let uri = msg.dest_uri()?;
        let transport = match uri.transport.clone() {
            Some(t) => t,
            None if uri.is_sips() => TransportType::Tls,
            None => {
                if msg.to_string().len() <= self.config.udp_mtu_threshold {
                    TransportType::Udp
                } else {
                    TransportType::Tcp
                }
            }
        };
        if !self.transports.contains_key(&transport) {
            Err(TransportError::NoTransport(transport.to_string()))?;
        }

        let host = uri.maddr.clone().unwrap_or_else(|| uri.host.clone());
        let port = uri.port.unwrap_or_else(|| transport.default_port());

        let mut out: Vec<Remote> = Vec::new();
        for addr in tokio::net::lookup_host((host.as_str(), port)).await? {
            let remote = Remote {
                host: host.clone(),
                ip: addr.ip().to_string(),
                port: addr.port(),
                transport: transport.clone(),
            };
            if !out.contains(&remote) {
                out.push(remote);
            }
        }
        Ok(out)
    }
}

pub enum Transport {
    Udp(UdpTransport),
    Tcp(TcpTransport),
    Tls(TlsTransport),
}

impl Transport {
    pub async fn send(&self, msg: String, dest: &Remote) -> Result<()> {
        match self {
            Transport::Udp(t) => t.send(msg, dest).await,
            Transport::Tcp(t) => t.send(msg, dest).await,
            Transport::Tls(t) => t.send(msg, dest).await,
        }
    }

    pub async fn listen(&self) -> Result<()> {
        match self {
            Transport::Udp(t) => t.listen().await,
            Transport::Tcp(t) => t.listen().await,
            Transport::Tls(t) => t.listen().await,
        }
    }

    pub async fn local_uri(&self) -> Result<Uri> {
        match self {
            Transport::Udp(t) => t.local_uri().await,
            Transport::Tcp(t) => t.local_uri().await,
            Transport::Tls(t) => t.local_uri().await,
        }
    }
}

/// Host to advertise in Via and Contact for a bound socket.
pub(crate) fn advertised_host(config: &Config, bound: &SocketAddr) -> String {
    if let Some(h) = &config.local_host {
        return h.clone();
    }
    let ip = bound.ip();
    if ip.is_unspecified() {
        quasar_utils::get_local_ip().unwrap_or_else(|| "127.0.0.1".to_string())
    } else {
        ip.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_tokens() {
        use std::str::FromStr;
        assert_eq!(TransportType::Tcp, TransportType::from_str("TCP").unwrap());
        assert_eq!(TransportType::Udp, TransportType::from_str("udp").unwrap());
        assert_eq!("tls", TransportType::Tls.to_string());
        assert!(TransportType::Tcp.is_reliable());
        assert!(!TransportType::Udp.is_reliable());
    }

    #[test]
    fn remote_addr_brackets_ipv6() {
        let remote = Remote {
            host: "example.net".to_string(),
            ip: "2001:db8::1".to_string(),
            port: 5060,
            transport: TransportType::Udp,
        };
        assert_eq!("[2001:db8::1]:5060", remote.addr());
    }
}
