use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_channel::Sender;
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio_rustls::rustls::{
    self, Certificate, ClientConfig, OwnedTrustAnchor, PrivateKey, ServerName,
};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, warn};

use crate::config::Config;
use crate::message::{Message, StreamParser};
use crate::transport::{advertised_host, Remote, TransportError, TransportType};
use crate::uri::Uri;

type ConnMap = Arc<
    RwLock<HashMap<String, Arc<Mutex<WriteHalf<TlsStream<TcpStream>>>>>>,
>;

pub struct TlsTransport {
    conns: ConnMap,
    msg_sender: Sender<Message>,
    local: Arc<RwLock<Option<(String, u16)>>>,
    config: Arc<Config>,
    client_config: Arc<ClientConfig>,
}

impl TlsTransport {
    pub fn new(msg_sender: Sender<Message>, config: Arc<Config>) -> Self {
        TlsTransport {
            conns: Arc::new(RwLock::new(HashMap::new())),
            msg_sender,
            local: Arc::new(RwLock::new(None)),
            config,
            client_config: tls_client_config(),
        }
    }

    /// The listener only starts when a certificate and key are configured;
    /// outbound TLS works either way.
    pub async fn listen(&self) -> Result<()> {
        let (cert, key) = match (&self.config.tls_cert, &self.config.tls_key) {
            (Some(cert), Some(key)) => (cert.clone(), key.clone()),
            _ => return Ok(()),
        };

        let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
            std::fs::File::open(&cert)?,
        ))
        .map(|mut certs| certs.drain(..).map(Certificate).collect::<Vec<_>>())?;
        let mut keys: Vec<PrivateKey> = rustls_pemfile::pkcs8_private_keys(
            &mut std::io::BufReader::new(std::fs::File::open(&key)?),
        )
        .map(|mut keys| keys.drain(..).map(PrivateKey).collect())?;
        if keys.is_empty() {
            keys = rustls_pemfile::rsa_private_keys(
                &mut std::io::BufReader::new(std::fs::File::open(&key)?),
            )
            .map(|mut keys| keys.drain(..).map(PrivateKey).collect())?;
        }
        if keys.is_empty() {
            return Err(anyhow!("no private key in {}", key.display()));
        }

        let tls_config = Arc::new(
            rustls::ServerConfig::builder()
                .with_safe_defaults()
                .with_no_client_auth()
                .with_single_cert(certs, keys.remove(0))?,
        );
        let acceptor = TlsAcceptor::from(tls_config);

        let addr = format!("{}:{}", self.config.listen_ip, self.config.tls_port);
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
                let acceptor = acceptor.clone();
                let conns = conns.clone();
                let msg_sender = msg_sender.clone();
                tokio::spawn(async move {
                    if let Ok(tls_stream) = acceptor.accept(stream).await {
                        let (recv, send) = split(tls_stream.into());
                        {
                            conns.write().await.insert(
                                peer_addr.to_string(),
                                Arc::new(Mutex::new(send)),
                            );
                        }
                        serve_stream(conns, recv, peer_addr, msg_sender).await;
                    }
                });
            }
        });
        Ok(())
    }

    async fn get_conn(
        &self,
        dest: &Remote,
    ) -> Result<Arc<Mutex<WriteHalf<TlsStream<TcpStream>>>>> {
        let addr = dest.addr();
        if let Some(conn) = self.conns.read().await.get(&addr).cloned() {
            return Ok(conn);
        }

        let server_name = ServerName::try_from(dest.host.as_str())
            .map_err(|_| anyhow!("invalid tls server name {}", dest.host))?;
        let connector = TlsConnector::from(self.client_config.clone());
        let stream = TcpStream::connect(&addr).await?;
        let peer_addr = stream.peer_addr()?;
        let tls_stream = connector.connect(server_name, stream).await?;
        let (recv, send) = split(tls_stream.into());
        let conn = Arc::new(Mutex::new(send));
        {
            self.conns.write().await.insert(addr, conn.clone());
        }
        let conns = self.conns.clone();
        let msg_sender = self.msg_sender.clone();
        tokio::spawn(async move {
            serve_stream(conns, recv, peer_addr, msg_sender).await;
        });
        Ok(conn)
    }

    pub async fn send(&self, msg: String, dest: &Remote) -> Result<()> {
        let conn = self.get_conn(dest).await?;
        let mut guard = conn.lock().await;
        if let Err(e) = guard.write_all(msg.as_bytes()).await {
            drop(guard);
            self.conns.write().await.remove(&dest.addr());
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
            transport: Some(TransportType::Tls),
            ..Default::default()
        })
    }
}

async fn serve_stream(
    conns: ConnMap,
    mut recv: ReadHalf<TlsStream<TcpStream>>,
    peer_addr: SocketAddr,
    msg_sender: Sender<Message>,
) {
    let mut parser = StreamParser::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = match recv.read(&mut buf).await {
            Ok(0) => {
                debug!("tls connection {peer_addr} closed by peer");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("tls connection {peer_addr} read error {e}");
                break;
            }
        };
        match parser.feed(&buf[..n]) {
            Ok(messages) => {
                for mut msg in messages {
                    msg.remote =
                        Some(Remote::from_peer(&peer_addr, TransportType::Tls));
                    let _ = msg_sender.send(msg).await;
                }
            }
            Err(e) => {
                warn!("closing tls connection {peer_addr}: {e}");
                break;
            }
        }
    }
    conns.write().await.remove(&peer_addr.to_string());
}

fn tls_client_config() -> Arc<ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.add_server_trust_anchors(
        webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }),
    );
    Arc::new(
        ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    )
}
