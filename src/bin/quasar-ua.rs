use std::sync::Arc;

use anyhow::Result;
use sip::config::Config;
use sip::headers::Method;
use sip::message::{reason_phrase, Message};
use sip::ua::{Ua, UaCallback, UasDisposition};

/// Minimal demonstration agent: answers OPTIONS, declines calls.
struct EchoAgent;

impl UaCallback for EchoAgent {
    fn server(&self, _req: &Message) -> String {
        "quasar-ua".to_string()
    }

    fn handle_request(&self, req: &Message) -> UasDisposition {
        match req.method() {
            Some(Method::Options) => UasDisposition::Reply(
                Message::response_to(req, 200, reason_phrase(200)),
            ),
            Some(Method::Invite) => UasDisposition::Reply(
                Message::response_to(req, 486, reason_phrase(486)),
            ),
            Some(Method::Bye) => UasDisposition::Reply(
                Message::response_to(req, 200, reason_phrase(200)),
            ),
            _ => UasDisposition::Noreply,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    quasar_log::init();

    let mut config = Config::default();
    if let Ok(ip) = std::env::var("QUASAR_LISTEN_IP") {
        config.listen_ip = ip;
    }
    if let Ok(port) = std::env::var("QUASAR_UDP_PORT") {
        config.udp_port = port.parse()?;
        config.tcp_port = config.udp_port;
    }

    let ua = Ua::start(config, Arc::new(EchoAgent)).await?;
    tracing::info!("quasar ua up");
    tokio::signal::ctrl_c().await?;
    ua.shutdown().await;
    Ok(())
}
