use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_channel::Sender;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::Config;
use crate::message::{Message, StreamParser};
use crate::transport::{advertised_host, Remote, TransportError, TransportType};
use crate::uri::Uri;

type ConnMap = Arc<RwLock<HashMap<String, Arc<Mutex<OwnedWriteHalf>>>>>;

/// TCP transport with a connection cache keyed by remote address, reused
/// for outbound sends and for routing responses back over the connection
/// the request arrived on.
pub struct TcpTransport {
    conns: ConnMap,
    msg_sender: Sender<Message>,
    local: Arc<RwLock<Option<(String, u16)>>>,
    config: Arc<Config>,
}

impl TcpTransport {
    pub fn new(msg_sender: Sender<Message>, config: Arc<Config>) -> Self {
        TcpTransport {
            conns: Arc::new(RwLock::new(HashMap::new())),
            msg_sender,
            local: Arc::new(RwLock::new(None)),
            config,
        }
    }

    pub async fn listen(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.listen_ip, self.config.tcp_port);
        let listener = TcpListener::bind(&addr).await?;
        let bound = listener.local_addr()?;
        {
            *self.local.write().await =
                Some((advertised_host(&self.config, &bound), bound.port()));
        }

        let conns = self.conns.clone();
        let msg_sender = self.msg_sender.clone();
        tokio::spawn(async move {
            while let Ok((stream, peer_addr)) = listener.accept().await {
                let (recv, send) = stream.into_split();
                {
                    conns
                        .write()
                        .await
                        .insert(peer_addr.to_string(), Arc::new(Mutex::new(send)));
                }
                let conns = conns.clone();
                let msg_sender = msg_sender.clone();
                tokio::spawn(async move {
                    serve_stream(conns, recv, peer_addr, msg_sender).await;
                });
            }
        });
        Ok(())
    }

    async fn get_conn(
        &self,
        addr: &str,
    ) -> Result<Arc<Mutex<OwnedWriteHalf>>> {
        if let Some(conn) = self.conns.read().await.get(addr).cloned() {
            return Ok(conn);
        }

        let stream = TcpStream::connect(addr).await?;
        let peer_addr = stream.peer_addr()?;
        let (recv, send) = stream.into_split();
        let conn = Arc::new(Mutex::new(send));
        {
            self.conns
                .write()
                .await
                .insert(addr.to_string(), conn.clone());
        }
        let conns = self.conns.clone();
        let msg_sender = self.msg_sender.clone();
        tokio::spawn(async move {
            serve_stream(conns, recv, peer_addr, msg_sender).await;
        });
        Ok(conn)
    }

    pub async fn send(&self, msg: String, dest: &Remote) -> Result<()> {
        let addr = dest.addr();
        let conn = self.get_conn(&addr).await?;
        let mut guard = conn.lock().await;
        if let Err(e) = guard.write_all(msg.as_bytes()).await {
            drop(guard);
            self.conns.write().await.remove(&addr);
            return Err(e.into());
        }
        guard.flush().await?;
        Ok(())
    }

    pub async fn local_uri(&self) -> Result<Uri> {
        let (host, port) = self
            .local
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotBound)?;
        Ok(Uri {
            scheme: "sip".to_string(),
            host,
            port: Some(port),
            transport: Some(TransportType::Tcp),
            ..Default::default()
        })
    }
}

async fn serve_stream(
    conns: ConnMap,
    mut recv: OwnedReadHalf,
    peer_addr: SocketAddr,
    msg_sender: Sender<Message>,
) {
    let mut parser = StreamParser::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = match recv.read(&mut buf).await {
            Ok(0) => {
                debug!("tcp connection {peer_addr} closed by peer");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("tcp connection {peer_addr} read error {e}");
                break;
            }
        };
        match parser.feed(&buf[..n]) {
            Ok(messages) => {
                for mut msg in messages {
                    msg.remote =
                        Some(Remote::from_peer(&peer_addr, TransportType::Tcp));
                    let _ = msg_sender.send(msg).await;
                }
            }
            Err(e) => {
                // framing errors are fatal for the connection
                warn!("closing tcp connection {peer_addr}: {e}");
                break;
            }
        }
    }
    conns.write().await.remove(&peer_addr.to_string());
}
