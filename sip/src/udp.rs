use std::sync::Arc;

use anyhow::Result;
use async_channel::Sender;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::config::Config;
use crate::message::{parse_datagram, Message};
use crate::transport::{advertised_host, Remote, TransportError, TransportType};
use crate::uri::Uri;

pub struct UdpTransport {
    socket: Arc<RwLock<Option<Arc<UdpSocket>>>>,
    local: Arc<RwLock<Option<(String, u16)>>>,
    msg_sender: Sender<Message>,
    config: Arc<Config>,
}

impl UdpTransport {
    pub fn new(msg_sender: Sender<Message>, config: Arc<Config>) -> Self {
        UdpTransport {
            socket: Arc::new(RwLock::new(None)),
            local: Arc::new(RwLock::new(None)),
            msg_sender,
            config,
        }
    }

    pub async fn listen(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.listen_ip, self.config.udp_port);
        let socket = UdpSocket::bind(&addr).await?;
        let bound = socket.local_addr()?;
        {
            *self.local.write().await =
                Some((advertised_host(&self.config, &bound), bound.port()));
        }

        let recv = Arc::new(socket);
        let send = recv.clone();
        let msg_sender = self.msg_sender.clone();
        tokio::spawn(async move {
            UdpTransport::run(recv, msg_sender).await;
            error!("udp listener stopped");
        });
        *self.socket.write().await = Some(send);

        Ok(())
    }

    async fn run(socket: Arc<UdpSocket>, msg_sender: Sender<Message>) {
        let mut buf = [0; 65535];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, addr)) => {
                    let data = buf[..n].to_vec();
                    let msg_sender = msg_sender.clone();
                    tokio::spawn(async move {
                        let parsed =
                            quasar_task::spawn_task(move || parse_datagram(&data))
                                .await;
                        match parsed {
                            Ok(Ok(mut msg)) => {
                                msg.remote = Some(Remote::from_peer(
                                    &addr,
                                    TransportType::Udp,
                                ));
                                let _ = msg_sender.send(msg).await;
                            }
                            Ok(Err(e)) => {
                                // parse errors on UDP are dropped
                                debug!("dropping datagram from {addr}: {e}");
                            }
                            Err(e) => error!("parse task failed: {e}"),
                        }
                    });
                }
                Err(e) => error!("udp socket receive error {e}"),
            }
        }
    }

    pub async fn send(&self, msg: String, dest: &Remote) -> Result<()> {
        let socket = {
            self.socket
                .read()
                .await
                .clone()
                .ok_or(TransportError::NotBound)?
        };
        let result = socket.send_to(msg.as_bytes(), dest.addr()).await;
        if let Err(e) = result.as_ref() {
            error!("udp socket send error {e}");
        }
        result?;
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
            transport: Some(TransportType::Udp),
            ..Default::default()
        })
    }
}
