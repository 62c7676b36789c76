use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Error, Result};
use async_channel::{Receiver, Sender};
use strum_macros::{self, EnumString};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::Config;
use crate::fsm::{self, Input, State};
use crate::headers::Method;
use crate::message::{Message, MessageError};
use crate::transport::{Remote, TransportError, TransportManager};

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("transaction does not exist")]
    NotExist,
    #[error("transaction already exists")]
    Exists,
    #[error("message not valid for this transaction")]
    NotValidMessage,
}

#[derive(strum_macros::Display, EnumString, PartialEq, Eq, Clone, Debug)]
pub enum TransactionType {
    Client,
    Server,
}

/// Client transactions match on (branch, sent-by, method); server
/// transactions identically, with ACK mapped onto the INVITE it
/// acknowledges. The sha256 of the tuple keys the transaction table.
#[derive(Clone, Debug)]
pub struct TransactionKey {
    pub branch: String,
    pub method: Method,
    pub sent_by_host: String,
    pub sent_by_port: u16,
    pub tx_type: TransactionType,
    encoded: String,
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", &self.encoded)
    }
}

impl TransactionKey {
    pub fn new(
        branch: String,
        method: Method,
        sent_by_host: String,
        sent_by_port: u16,
        tx_type: TransactionType,
    ) -> TransactionKey {
        TransactionKey {
            encoded: quasar_utils::sha256(&format!(
                "{}{}{}{}{}",
                &branch, &method, &sent_by_host, sent_by_port, &tx_type
            )),
            branch,
            method,
            sent_by_host,
            sent_by_port,
            tx_type,
        }
    }

    pub fn from_msg(
        msg: &Message,
        tx_type: TransactionType,
    ) -> Result<TransactionKey, Error> {
        let via = msg.top_via()?;
        let method = match msg.cseq_method()? {
            Method::Ack => Method::Invite,
            m => m,
        };
        Ok(TransactionKey::new(
            via.branch,
            method,
            via.host,
            via.port.unwrap_or(5060),
            tx_type,
        ))
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminateReason {
    Normal,
    Timeout,
    TransportError,
}

/// What a transaction reports to its transaction user.
#[derive(Clone, Debug)]
pub enum TuEvent {
    Response(Message),
    Terminated(TerminateReason),
}

pub type TuSender = Sender<(TransactionKey, TuEvent)>;

pub(crate) struct TxInner {
    pub state: State,
    pub request: Message,
    /// Last response sent by a server transaction; retransmitted on
    /// duplicate requests and by Timer G.
    pub last_response: Option<Message>,
    /// Latest response received by a client transaction.
    pub response: Option<Message>,
    pub resend_count: u32,
    pub tu: Option<TuSender>,
}

pub(crate) struct TxState {
    pub key: TransactionKey,
    pub remote: Remote,
    pub reliable: bool,
    pub inner: Mutex<TxInner>,
}

/// The shared transaction engine: the transport stack, the transaction
/// table, and the channel unmatched requests are routed through to the UAS
/// core. One instance per UA.
pub struct TransactionCore {
    pub transport: TransportManager,
    pub config: Arc<Config>,
    transactions: RwLock<HashMap<String, Arc<TxState>>>,
    router_sender: Sender<Message>,
}

impl TransactionCore {
    pub fn new(config: Arc<Config>) -> (Arc<TransactionCore>, Receiver<Message>) {
        let (msg_sender, msg_receiver): (Sender<Message>, Receiver<Message>) =
            async_channel::unbounded();
        let (router_sender, router_receiver) = async_channel::unbounded();

        let transport = TransportManager::new(msg_sender, config.clone());
        let core = Arc::new(TransactionCore {
            transport,
            config,
            transactions: RwLock::new(HashMap::new()),
            router_sender,
        });

        let ingress = core.clone();
        tokio::spawn(async move {
            while let Ok(msg) = msg_receiver.recv().await {
                let core = ingress.clone();
                tokio::spawn(async move {
                    core.handle_msg(msg).await;
                });
            }
        });

        (core, router_receiver)
    }

    pub async fn listen(&self) -> Result<()> {
        self.transport.listen().await
    }

    /// Demultiplex an inbound message: requests go to their server
    /// transaction or, unmatched, to the UAS core; responses go to their
    /// client transaction or are dropped.
    async fn handle_msg(self: Arc<Self>, msg: Message) {
        if msg.is_request() {
            let key =
                match TransactionKey::from_msg(&msg, TransactionType::Server) {
                    Ok(key) => key,
                    Err(e) => {
                        debug!("dropping request without usable via: {e}");
                        return;
                    }
                };
            match self.find(&key).await {
                Some(tx) => {
                    if let Err(e) = tx.receive(msg).await {
                        debug!("server transaction rejected message: {e}");
                    }
                }
                None => {
                    let _ = self.router_sender.send(msg).await;
                }
            }
        } else {
            let key =
                match TransactionKey::from_msg(&msg, TransactionType::Client) {
                    Ok(key) => key,
                    Err(e) => {
                        debug!("dropping response without usable via: {e}");
                        return;
                    }
                };
            match self.find(&key).await {
                Some(tx) => {
                    if let Err(e) = tx.receive(msg).await {
                        debug!("client transaction rejected message: {e}");
                    }
                }
                None => {
                    debug!("dropping response matching no transaction");
                }
            }
        }
    }

    /// Start a client transaction for a prepared request (Via and remote
    /// endpoint already in place) and send it. A transport failure still
    /// yields a transaction; its TU sees `terminated(transport_error)`.
    pub async fn client_transaction(
        self: &Arc<Self>,
        msg: &Message,
        tu: TuSender,
    ) -> Result<Transaction> {
        let remote = msg
            .remote
            .clone()
            .ok_or(TransportError::NoRemote)?;
        let key = TransactionKey::from_msg(msg, TransactionType::Client)?;
        let invite = key.method == Method::Invite;
        let state = if invite { State::Calling } else { State::Trying };
        let tx = self
            .insert(
                key,
                remote,
                TxInner {
                    state,
                    request: msg.clone(),
                    last_response: None,
                    response: None,
                    resend_count: 0,
                    tu: Some(tu),
                },
            )
            .await?;

        match self.transport.send(msg).await {
            Ok(()) => {
                if !tx.st.reliable {
                    let retransmit =
                        if invite { Input::TimerA } else { Input::TimerE };
                    tx.register_timer(self.config.t1(), retransmit);
                }
                let timeout = if invite { Input::TimerB } else { Input::TimerF };
                tx.register_timer(64 * self.config.t1(), timeout);
            }
            Err(e) => {
                warn!(
                    channel = %msg.call_id().unwrap_or_default(),
                    "send failed for new client transaction: {e}"
                );
                let _ = fsm::spin(&tx, Input::TransportError).await;
            }
        }
        Ok(tx)
    }

    /// Adopt an unmatched inbound request as a new server transaction.
    pub async fn server_transaction(
        self: &Arc<Self>,
        msg: &Message,
        tu: Option<TuSender>,
    ) -> Result<Transaction> {
        let remote = msg
            .remote
            .clone()
            .ok_or(TransportError::NoRemote)?;
        let key = TransactionKey::from_msg(msg, TransactionType::Server)?;
        let invite = key.method == Method::Invite;
        let state = if invite { State::Proceeding } else { State::Trying };
        let tx = self
            .insert(
                key,
                remote,
                TxInner {
                    state,
                    request: msg.clone(),
                    last_response: None,
                    response: None,
                    resend_count: 0,
                    tu,
                },
            )
            .await?;

        if invite {
            // answer 100 Trying ourselves if the TU stays quiet
            tx.register_timer(self.config.trying_delay(), Input::Timer100);
        }
        Ok(tx)
    }

    async fn insert(
        self: &Arc<Self>,
        key: TransactionKey,
        remote: Remote,
        inner: TxInner,
    ) -> Result<Transaction> {
        let st = Arc::new(TxState {
            reliable: remote.transport.is_reliable(),
            remote,
            key: key.clone(),
            inner: Mutex::new(inner),
        });
        {
            let mut table = self.transactions.write().await;
            if table.contains_key(key.encoded()) {
                Err(TransactionError::Exists)?;
            }
            table.insert(key.encoded().to_string(), st.clone());
        }
        debug!("transaction {} created ({} {})", key, key.tx_type, key.method);
        Ok(Transaction {
            core: self.clone(),
            st,
        })
    }

    pub async fn find(
        self: &Arc<Self>,
        key: &TransactionKey,
    ) -> Option<Transaction> {
        let st = self
            .transactions
            .read()
            .await
            .get(key.encoded())
            .cloned()?;
        Some(Transaction {
            core: self.clone(),
            st,
        })
    }

    pub(crate) async fn remove(&self, key: &TransactionKey) {
        self.transactions.write().await.remove(key.encoded());
        debug!("transaction {} terminated", key);
    }

    pub async fn len(&self) -> usize {
        self.transactions.read().await.len()
    }

    /// Termination signal for every owned transaction; used when the UA
    /// shuts down.
    pub async fn shutdown(self: &Arc<Self>) {
        let all: Vec<Arc<TxState>> =
            self.transactions.read().await.values().cloned().collect();
        for st in all {
            let tx = Transaction {
                core: self.clone(),
                st,
            };
            let _ = fsm::spin(&tx, Input::Shutdown).await;
        }
    }
}

#[derive(Clone)]
pub struct Transaction {
    pub(crate) core: Arc<TransactionCore>,
    pub(crate) st: Arc<TxState>,
}

impl Transaction {
    pub fn key(&self) -> &TransactionKey {
        &self.st.key
    }

    pub fn remote(&self) -> &Remote {
        &self.st.remote
    }

    pub(crate) fn register_timer(&self, duration: Duration, input: Input) {
        let tx = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = fsm::spin(&tx, input).await;
        });
    }

    pub(crate) async fn receive(&self, msg: Message) -> Result<()> {
        match self.st.key.tx_type {
            TransactionType::Server => {
                let input = match msg.method() {
                    Some(Method::Ack) => Input::Ack,
                    Some(m) if *m == self.st.key.method => Input::Req,
                    _ => Err(TransactionError::NotValidMessage)?,
                };
                fsm::spin(self, input).await
            }
            TransactionType::Client => {
                let code = msg.code().ok_or(MessageError::NotResponse)?;
                {
                    let mut inner = self.st.inner.lock().await;
                    inner.response = Some(msg);
                }
                fsm::spin(self, input_for_code(code)).await
            }
        }
    }

    /// Feed a TU-originated response into a server transaction.
    pub async fn respond(&self, resp: &Message) -> Result<()> {
        if self.st.key.tx_type != TransactionType::Server {
            Err(TransactionError::NotValidMessage)?;
        }
        let code = resp.code().ok_or(MessageError::NotResponse)?;
        let mut resp = resp.clone();
        resp.remote = Some(self.st.remote.clone());
        {
            let mut inner = self.st.inner.lock().await;
            inner.last_response = Some(resp);
        }
        fsm::spin(self, input_for_code(code)).await
    }

    pub(crate) async fn send_request(&self, inner: &TxInner) -> Result<()> {
        self.core.transport.send(&inner.request).await
    }

    pub(crate) async fn send_last_response(&self, inner: &TxInner) -> Result<()> {
        match inner.last_response.as_ref() {
            Some(resp) => self.core.transport.send(resp).await,
            None => Ok(()),
        }
    }

    /// 100 Trying on the TU's behalf, unless it already produced something.
    pub(crate) async fn send_trying(&self, inner: &mut TxInner) -> Result<()> {
        if inner.last_response.is_some() {
            return Ok(());
        }
        let mut resp = Message::response_to(
            &inner.request,
            100,
            crate::message::reason_phrase(100),
        );
        resp.remote = Some(self.st.remote.clone());
        let result = self.core.transport.send(&resp).await;
        inner.last_response = Some(resp);
        result
    }

    /// ACK for a non-2xx final response, straight from the transaction per
    /// §17.1.1.3.
    pub(crate) async fn send_ack(&self, inner: &TxInner) -> Result<()> {
        let resp = inner
            .response
            .as_ref()
            .ok_or(MessageError::NotResponse)?;
        let mut ack = Message::ack_for(&inner.request, resp)?;
        ack.remote = Some(self.st.remote.clone());
        self.core.transport.send(&ack).await
    }

    pub(crate) async fn passup(&self, inner: &TxInner) {
        if let (Some(tu), Some(resp)) = (&inner.tu, &inner.response) {
            let _ = tu
                .send((self.st.key.clone(), TuEvent::Response(resp.clone())))
                .await;
        }
    }

    pub(crate) async fn notify_terminated(
        &self,
        tu: Option<TuSender>,
        reason: TerminateReason,
    ) {
        if let Some(tu) = tu {
            let _ = tu
                .send((self.st.key.clone(), TuEvent::Terminated(reason)))
                .await;
        }
    }
}

pub(crate) fn input_for_code(code: u16) -> Input {
    match code {
        code if code < 200 => Input::Resp1xx,
        code if code < 300 => Input::Resp2xx,
        _ => Input::Resp300to699,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn invite() -> Message {
        Message::from_str(
            &[
                "INVITE sip:bob@biloxi.com SIP/2.0",
                "Via: SIP/2.0/UDP 10.0.0.9:5090;branch=z9hG4bKnashds8",
                "To: <sip:bob@biloxi.com>",
                "From: <sip:alice@atlanta.com>;tag=1928301774",
                "Call-ID: a84b4c76e66710",
                "CSeq: 314159 INVITE",
                "Content-Length: 0",
                "",
                "",
            ]
            .join("\r\n"),
        )
        .unwrap()
    }

    #[test]
    fn key_maps_ack_to_invite() {
        let invite = invite();
        let ack_text = [
            "ACK sip:bob@biloxi.com SIP/2.0",
            "Via: SIP/2.0/UDP 10.0.0.9:5090;branch=z9hG4bKnashds8",
            "To: <sip:bob@biloxi.com>;tag=a6c85cf",
            "From: <sip:alice@atlanta.com>;tag=1928301774",
            "Call-ID: a84b4c76e66710",
            "CSeq: 314159 ACK",
            "Content-Length: 0",
            "",
            "",
        ]
        .join("\r\n");
        let ack = Message::from_str(&ack_text).unwrap();

        let k1 =
            TransactionKey::from_msg(&invite, TransactionType::Server).unwrap();
        let k2 = TransactionKey::from_msg(&ack, TransactionType::Server).unwrap();
        assert_eq!(k1.encoded(), k2.encoded());
        assert_eq!(Method::Invite, k2.method);
    }

    #[test]
    fn key_distinguishes_branch_and_role() {
        let invite = invite();
        let client =
            TransactionKey::from_msg(&invite, TransactionType::Client).unwrap();
        let server =
            TransactionKey::from_msg(&invite, TransactionType::Server).unwrap();
        assert_ne!(client.encoded(), server.encoded());

        let mut other = invite.clone();
        let via = "SIP/2.0/UDP 10.0.0.9:5090;branch=z9hG4bKdifferent";
        other.headers.set(
            crate::headers::HeaderName::Via,
            crate::headers::HeaderValue::Raw(via.to_string()),
        );
        let k2 =
            TransactionKey::from_msg(&other, TransactionType::Client).unwrap();
        assert_ne!(client.encoded(), k2.encoded());
    }
}
