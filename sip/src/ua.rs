use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::dialog::{DialogId, DialogTable};
use crate::headers::{Address, Method};
use crate::message::{reason_phrase, Message};
use crate::transaction::{TransactionCore, TuEvent, TuSender};
use crate::transport::TransportType;
use crate::uac::{self, PendingRequest};
use crate::uas;

pub type RequestId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UaError {
    #[error("no destinations for request")]
    NoDestinations,
    #[error("no matching request")]
    NoRequest,
    #[error("request timed out")]
    Timeout,
    #[error("transport error")]
    TransportError,
}

/// What a method handler tells the UAS core: answer now, or stay quiet and
/// respond later through `Ua::send_response`.
pub enum UasDisposition {
    Reply(Message),
    Noreply,
}

/// Application-side policy and method handling. Every hook has a workable
/// default except the method handler itself.
pub trait UaCallback: Send + Sync + 'static {
    fn allow(&self, _req: &Message) -> Vec<Method> {
        vec![
            Method::Invite,
            Method::Ack,
            Method::Cancel,
            Method::Bye,
            Method::Options,
        ]
    }

    fn supported(&self, _req: &Message) -> Vec<String> {
        Vec::new()
    }

    fn server(&self, _req: &Message) -> String {
        "quasar".to_string()
    }

    fn detect_loops(&self, _req: &Message) -> bool {
        true
    }

    /// Gate for multi-UA dispatch; a UA that returns false never sees the
    /// message.
    fn is_applicable(&self, _msg: &Message) -> bool {
        true
    }

    /// Digest credentials for a realm, used for the automatic 401/407
    /// retry.
    fn credentials(&self, _realm: &str) -> Option<(String, String)> {
        None
    }

    fn handle_request(&self, req: &Message) -> UasDisposition;
}

pub type ResponseCallback =
    Arc<dyn Fn(RequestId, Result<Message, UaError>) + Send + Sync>;

pub(crate) struct UaInner {
    pub config: Arc<Config>,
    pub callback: Arc<dyn UaCallback>,
    pub core: Arc<TransactionCore>,
    pub dialogs: DialogTable,
    pub pending: Mutex<HashMap<RequestId, Arc<PendingRequest>>>,
    pub next_id: AtomicU64,
    pub loop_cache: Mutex<HashMap<String, (String, Instant)>>,
    pub server_tu: TuSender,
    pub local_host: String,
}

/// A User Agent: one transaction core, one transport stack, a dialog
/// table, and the sibling UAC and UAS cores driving them.
pub struct Ua {
    pub(crate) inner: Arc<UaInner>,
}

impl Ua {
    pub async fn start(
        config: Config,
        callback: Arc<dyn UaCallback>,
    ) -> Result<Ua> {
        let config = Arc::new(config);
        let (core, router_receiver) = TransactionCore::new(config.clone());
        core.listen().await?;

        // the UA is the transaction user for server transactions; their
        // lifecycle notifications only need draining
        let (server_tu, server_events) = async_channel::unbounded();
        tokio::spawn(async move {
            while let Ok((key, event)) = server_events.recv().await {
                if let TuEvent::Terminated(reason) = event {
                    debug!("server transaction {} closed: {:?}", key, reason);
                }
            }
        });

        let local_host = match core.transport.local_uri(&TransportType::Udp).await
        {
            Ok(uri) => uri.host,
            Err(_) => quasar_utils::get_local_ip()
                .unwrap_or_else(|| "127.0.0.1".to_string()),
        };

        let inner = Arc::new(UaInner {
            config,
            callback,
            core,
            dialogs: DialogTable::new(),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            loop_cache: Mutex::new(HashMap::new()),
            server_tu,
            local_host,
        });

        let router = inner.clone();
        tokio::spawn(async move {
            while let Ok(msg) = router_receiver.recv().await {
                let inner = router.clone();
                tokio::spawn(async move {
                    uas::handle_request(inner, msg).await;
                });
            }
        });

        Ok(Ua { inner })
    }

    /// New out-of-dialog request per §8.1.1: To, From (tagged), Call-ID,
    /// CSeq, Max-Forwards and any preloaded route set. Via and Contact are
    /// stamped per attempt when the request goes out.
    pub fn create_request(&self, method: Method, to: &Address) -> Message {
        uac::create_request(&self.inner, method, to)
    }

    /// New in-dialog request aimed at the dialog's remote target.
    pub async fn create_request_in_dialog(
        &self,
        method: Method,
        dialog: &DialogId,
    ) -> Option<Message> {
        self.inner.dialogs.create_request(dialog, method).await
    }

    /// Hand a request to the UAC core. The callback sees every response
    /// and the final outcome, always from a task other than the caller's.
    pub async fn send_request(
        &self,
        msg: Message,
        callback: ResponseCallback,
    ) -> Result<RequestId, UaError> {
        uac::send_request(&self.inner, msg, callback).await
    }

    /// Cancel a pending request (§9). Before any provisional response the
    /// CANCEL is deferred; afterwards it goes out immediately. Idempotent.
    pub async fn cancel_request(&self, id: RequestId) -> Result<(), UaError> {
        uac::cancel_request(&self.inner, id).await
    }

    pub fn create_response(
        &self,
        req: &Message,
        code: u16,
        reason: Option<&str>,
    ) -> Message {
        Message::response_to(req, code, reason.unwrap_or(reason_phrase(code)))
    }

    /// Send a response for a request currently held by a server
    /// transaction.
    pub async fn send_response(
        &self,
        req: &Message,
        resp: Message,
    ) -> Result<()> {
        uas::send_response(&self.inner, req, resp).await
    }

    pub fn dialogs(&self) -> &DialogTable {
        &self.inner.dialogs
    }

    /// Terminate every transaction this UA owns.
    pub async fn shutdown(&self) {
        self.inner.core.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::{HeaderName, HeaderValue};
    use crate::message::reason_phrase;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Forwards every dispatched request to the test body, which drives
    /// responses through `Ua::send_response`.
    struct ChannelAgent {
        tx: mpsc::UnboundedSender<Message>,
        allow: Vec<Method>,
        supported: Vec<String>,
        credentials: Option<(String, String)>,
    }

    impl ChannelAgent {
        fn new(
            tx: mpsc::UnboundedSender<Message>,
        ) -> ChannelAgent {
            ChannelAgent {
                tx,
                allow: vec![
                    Method::Invite,
                    Method::Ack,
                    Method::Cancel,
                    Method::Bye,
                    Method::Options,
                    Method::Register,
                ],
                supported: Vec::new(),
                credentials: None,
            }
        }
    }

    impl UaCallback for ChannelAgent {
        fn allow(&self, _req: &Message) -> Vec<Method> {
            self.allow.clone()
        }

        fn supported(&self, _req: &Message) -> Vec<String> {
            self.supported.clone()
        }

        fn credentials(&self, _realm: &str) -> Option<(String, String)> {
            self.credentials.clone()
        }

        fn handle_request(&self, req: &Message) -> UasDisposition {
            let _ = self.tx.send(req.clone());
            UasDisposition::Noreply
        }
    }

    /// Replies 200 to everything it is asked about, counting dispatches.
    struct SimpleAgent {
        handled: AtomicUsize,
    }

    impl SimpleAgent {
        fn new() -> SimpleAgent {
            SimpleAgent {
                handled: AtomicUsize::new(0),
            }
        }
    }

    impl UaCallback for SimpleAgent {
        fn handle_request(&self, req: &Message) -> UasDisposition {
            self.handled.fetch_add(1, Ordering::SeqCst);
            UasDisposition::Reply(Message::response_to(
                req,
                200,
                reason_phrase(200),
            ))
        }
    }

    fn test_config(t1_ms: u64) -> Config {
        Config {
            listen_ip: "127.0.0.1".to_string(),
            udp_port: 0,
            tcp_port: 0,
            local_host: Some("127.0.0.1".to_string()),
            t1_ms,
            ..Default::default()
        }
    }

    async fn start_ua(
        callback: Arc<dyn UaCallback>,
        t1_ms: u64,
    ) -> (Ua, u16) {
        let ua = Ua::start(test_config(t1_ms), callback).await.unwrap();
        let port = ua
            .inner
            .core
            .transport
            .local_uri(&TransportType::Udp)
            .await
            .unwrap()
            .port
            .unwrap();
        (ua, port)
    }

    fn collector() -> (
        ResponseCallback,
        mpsc::UnboundedReceiver<(RequestId, Result<Message, UaError>)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cb: ResponseCallback = Arc::new(move |id, result| {
            let _ = tx.send((id, result));
        });
        (cb, rx)
    }

    fn target(user: &str, port: u16) -> Address {
        Address::from_str(&format!("<sip:{user}@127.0.0.1:{port}>")).unwrap()
    }

    async fn next_code(
        rx: &mut mpsc::UnboundedReceiver<(RequestId, Result<Message, UaError>)>,
    ) -> Result<Message, UaError> {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap().1
    }

    #[tokio::test]
    async fn happy_invite_establishes_dialog() {
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let (ua_b, port_b) =
            start_ua(Arc::new(ChannelAgent::new(b_tx)), 500).await;
        let (ua_a, _) = start_ua(Arc::new(SimpleAgent::new()), 500).await;

        let invite =
            ua_a.create_request(Method::Invite, &target("bob", port_b));
        let (cb, mut responses) = collector();
        ua_a.send_request(invite, cb).await.unwrap();

        let seen = timeout(WAIT, b_rx.recv()).await.unwrap().unwrap();
        assert_eq!(Some(&Method::Invite), seen.method());
        let ringing = ua_b.create_response(&seen, 180, None);
        ua_b.send_response(&seen, ringing).await.unwrap();
        let ok = ua_b.create_response(&seen, 200, None);
        ua_b.send_response(&seen, ok).await.unwrap();

        // provisional first, then the final; an automatic 100 may lead
        let mut codes = Vec::new();
        loop {
            let resp = next_code(&mut responses).await.unwrap();
            codes.push(resp.code().unwrap());
            if resp.code() == Some(200) {
                // 2xx Contact becomes the remote target
                assert_eq!(1, ua_a.dialogs().len().await);
                break;
            }
        }
        assert!(codes.contains(&180));
        assert_eq!(Some(&200), codes.last());

        // callee also tracked the dialog off its 2xx
        assert_eq!(1, ua_b.dialogs().len().await);

        // the caller acknowledges the 2xx by itself, on a fresh branch
        // and under the INVITE's CSeq number
        let ack = timeout(WAIT, b_rx.recv()).await.unwrap().unwrap();
        assert_eq!(Some(&Method::Ack), ack.method());
        assert_ne!(
            seen.top_via().unwrap().branch,
            ack.top_via().unwrap().branch
        );
        let ack_cseq = ack.cseq().unwrap();
        assert_eq!(seen.cseq().unwrap().seq, ack_cseq.seq);
        assert_eq!(Method::Ack, ack_cseq.method);
    }

    #[tokio::test]
    async fn options_not_allowed_gets_405_with_allow() {
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let mut agent = ChannelAgent::new(b_tx);
        agent.allow = vec![Method::Invite];
        let (_ua_b, port_b) = start_ua(Arc::new(agent), 500).await;
        let (ua_a, _) = start_ua(Arc::new(SimpleAgent::new()), 500).await;

        let options =
            ua_a.create_request(Method::Options, &target("bob", port_b));
        let (cb, mut responses) = collector();
        ua_a.send_request(options, cb).await.unwrap();

        let resp = next_code(&mut responses).await.unwrap();
        assert_eq!(Some(405), resp.code());
        match resp.headers.typed(&HeaderName::Allow).unwrap() {
            Some(HeaderValue::Methods(methods)) => {
                assert_eq!(vec![Method::Invite], methods)
            }
            other => panic!("unexpected Allow {other:?}"),
        }
        // the method handler never ran
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_require_gets_420_with_unsupported() {
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let (_ua_b, port_b) =
            start_ua(Arc::new(ChannelAgent::new(b_tx)), 500).await;
        let (ua_a, _) = start_ua(Arc::new(SimpleAgent::new()), 500).await;

        let mut options =
            ua_a.create_request(Method::Options, &target("bob", port_b));
        options.headers.push(
            HeaderName::Require,
            HeaderValue::Tokens(vec!["foo".to_string()]),
        );
        let (cb, mut responses) = collector();
        ua_a.send_request(options, cb).await.unwrap();

        let resp = next_code(&mut responses).await.unwrap();
        assert_eq!(Some(420), resp.code());
        match resp.headers.typed(&HeaderName::Unsupported).unwrap() {
            Some(HeaderValue::Tokens(tokens)) => {
                assert_eq!(vec!["foo".to_string()], tokens)
            }
            other => panic!("unexpected Unsupported {other:?}"),
        }
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn redirect_follows_q_order() {
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let (ua_b, port_b) =
            start_ua(Arc::new(ChannelAgent::new(b_tx)), 500).await;
        let (y_tx, mut y_rx) = mpsc::unbounded_channel();
        let (ua_y, port_y) =
            start_ua(Arc::new(ChannelAgent::new(y_tx)), 500).await;
        let (x_tx, mut x_rx) = mpsc::unbounded_channel();
        let (_ua_x, port_x) =
            start_ua(Arc::new(ChannelAgent::new(x_tx)), 500).await;
        let (ua_a, _) = start_ua(Arc::new(SimpleAgent::new()), 500).await;

        let invite =
            ua_a.create_request(Method::Invite, &target("bob", port_b));
        let (cb, mut responses) = collector();
        ua_a.send_request(invite, cb).await.unwrap();

        // the first hop redirects: y has the higher q and goes first
        let seen_b = timeout(WAIT, b_rx.recv()).await.unwrap().unwrap();
        let mut moved = ua_b.create_response(&seen_b, 302, None);
        moved.headers.set(
            HeaderName::Contact,
            HeaderValue::Raw(format!(
                "<sip:x@127.0.0.1:{port_x}>;q=0.6, <sip:y@127.0.0.1:{port_y}>;q=0.9"
            )),
        );
        ua_b.send_response(&seen_b, moved).await.unwrap();

        let seen_y = timeout(WAIT, y_rx.recv()).await.unwrap().unwrap();
        assert_eq!(
            Some("y".to_string()),
            seen_y.request_uri().unwrap().user.clone()
        );
        let ok = ua_y.create_response(&seen_y, 200, None);
        ua_y.send_response(&seen_y, ok).await.unwrap();

        loop {
            let resp = next_code(&mut responses).await.unwrap();
            if resp.code() == Some(200) {
                break;
            }
        }
        // the winner answered before x was ever tried
        assert!(x_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn digest_retry_after_401() {
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let (ua_b, port_b) =
            start_ua(Arc::new(ChannelAgent::new(b_tx)), 500).await;
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let mut agent_a = ChannelAgent::new(a_tx);
        agent_a.credentials =
            Some(("alice".to_string(), "secret".to_string()));
        let (ua_a, _) = start_ua(Arc::new(agent_a), 500).await;

        let register =
            ua_a.create_request(Method::Register, &target("alice", port_b));
        let ruri = register.request_uri().unwrap().to_string();
        let (cb, mut responses) = collector();
        ua_a.send_request(register, cb).await.unwrap();

        let first = timeout(WAIT, b_rx.recv()).await.unwrap().unwrap();
        assert_eq!(1, first.cseq().unwrap().seq);
        let mut challenge = ua_b.create_response(&first, 401, None);
        challenge.headers.set(
            HeaderName::WwwAuthenticate,
            HeaderValue::Raw(r#"Digest realm="x", nonce="n""#.to_string()),
        );
        ua_b.send_response(&first, challenge).await.unwrap();

        // the retry carries the digest answer and a bumped CSeq
        let second = timeout(WAIT, b_rx.recv()).await.unwrap().unwrap();
        assert_eq!(2, second.cseq().unwrap().seq);
        let auth = match second
            .headers
            .typed(&HeaderName::Authorization)
            .unwrap()
        {
            Some(HeaderValue::Auth(auth)) => auth,
            other => panic!("no authorization header: {other:?}"),
        };
        assert_eq!(Some("alice"), auth.get("username"));
        assert_eq!(Some("x"), auth.get("realm"));
        let ha1 = quasar_utils::md5("alice:x:secret");
        let ha2 = quasar_utils::md5(&format!("REGISTER:{ruri}"));
        let expected = quasar_utils::md5(&format!("{ha1}:n:{ha2}"));
        assert_eq!(Some(expected.as_str()), auth.get("response"));

        let ok = ua_b.create_response(&second, 200, None);
        ua_b.send_response(&second, ok).await.unwrap();
        let resp = next_code(&mut responses).await.unwrap();
        assert_eq!(Some(200), resp.code());
    }

    #[tokio::test]
    async fn cancel_after_provisional_yields_487() {
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let (ua_b, port_b) =
            start_ua(Arc::new(ChannelAgent::new(b_tx)), 500).await;
        let (ua_a, _) = start_ua(Arc::new(SimpleAgent::new()), 500).await;

        let invite =
            ua_a.create_request(Method::Invite, &target("bob", port_b));
        let (cb, mut responses) = collector();
        let id = ua_a.send_request(invite, cb).await.unwrap();

        let seen = timeout(WAIT, b_rx.recv()).await.unwrap().unwrap();
        let ringing = ua_b.create_response(&seen, 180, None);
        ua_b.send_response(&seen, ringing).await.unwrap();

        // wait for the provisional, then cancel
        loop {
            let resp = next_code(&mut responses).await.unwrap();
            if resp.code() == Some(180) {
                break;
            }
        }
        ua_a.cancel_request(id).await.unwrap();
        // cancelling twice is fine
        ua_a.cancel_request(id).await.unwrap();

        // the callee's UAS answers the CANCEL itself and 487s the INVITE
        let resp = next_code(&mut responses).await.unwrap();
        assert_eq!(Some(487), resp.code());

        // the handler was told about the CANCEL
        let cancel = timeout(WAIT, b_rx.recv()).await.unwrap().unwrap();
        assert_eq!(Some(&Method::Cancel), cancel.method());
    }

    #[tokio::test]
    async fn looped_cancel_answers_482() {
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        let (_ua_b, port_b) =
            start_ua(Arc::new(ChannelAgent::new(b_tx)), 500).await;

        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local_port = socket.local_addr().unwrap().port();
        let request = |method: &str, branch: &str| {
            [
                format!("{method} sip:bob@127.0.0.1:{port_b} SIP/2.0"),
                format!(
                    "Via: SIP/2.0/UDP 127.0.0.1:{local_port};branch={branch}"
                ),
                "Max-Forwards: 70".to_string(),
                format!("To: <sip:bob@127.0.0.1:{port_b}>"),
                "From: <sip:probe@127.0.0.1>;tag=cltest".to_string(),
                "Call-ID: cancel-loop-1".to_string(),
                format!("CSeq: 1 {method}"),
                "Content-Length: 0".to_string(),
                String::new(),
                String::new(),
            ]
            .join("\r\n")
        };
        let dest = format!("127.0.0.1:{port_b}");
        let mut buf = [0u8; 4096];

        socket
            .send_to(request("INVITE", "z9hG4bKcl1").as_bytes(), &dest)
            .await
            .unwrap();
        // the automatic 100 Trying proves the INVITE transaction is up
        loop {
            let (n, _) = timeout(WAIT, socket.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let msg = Message::from_str(
                std::str::from_utf8(&buf[..n]).unwrap(),
            )
            .unwrap();
            if msg.code() == Some(100) {
                break;
            }
        }
        socket
            .send_to(request("CANCEL", "z9hG4bKcl1").as_bytes(), &dest)
            .await
            .unwrap();

        // the matching CANCEL gets its 200 (487 for the INVITE is
        // interleaved and skipped here)
        loop {
            let (n, _) = timeout(WAIT, socket.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let msg = Message::from_str(
                std::str::from_utf8(&buf[..n]).unwrap(),
            )
            .unwrap();
            if msg.cseq().unwrap().method == Method::Cancel {
                assert_eq!(Some(200), msg.code());
                break;
            }
        }

        // same CANCEL identity on a different branch loops back to us
        socket
            .send_to(request("CANCEL", "z9hG4bKcl2").as_bytes(), &dest)
            .await
            .unwrap();
        loop {
            let (n, _) = timeout(WAIT, socket.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let msg = Message::from_str(
                std::str::from_utf8(&buf[..n]).unwrap(),
            )
            .unwrap();
            if msg.cseq().unwrap().method == Method::Cancel
                && msg.code() != Some(200)
            {
                assert_eq!(Some(482), msg.code());
                break;
            }
        }
    }

    #[tokio::test]
    async fn cancel_of_unknown_request() {
        let (ua_a, _) = start_ua(Arc::new(SimpleAgent::new()), 500).await;
        assert_eq!(Err(UaError::NoRequest), ua_a.cancel_request(42).await);
    }

    #[tokio::test]
    async fn invite_retransmits_and_times_out() {
        // a socket that swallows everything
        let sink = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = sink.local_addr().unwrap().port();
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                if sink.recv_from(&mut buf).await.is_err() {
                    break;
                }
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        // T1 = 40ms: retransmits at 40, 80, 160... Timer B at 64*T1 = 2.56s
        let (ua_a, _) = start_ua(Arc::new(SimpleAgent::new()), 40).await;
        let invite =
            ua_a.create_request(Method::Invite, &target("bob", port));
        let (cb, mut responses) = collector();
        ua_a.send_request(invite, cb).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        let sent = counter.load(Ordering::SeqCst);
        // original plus at least the 40/80/160ms retransmissions
        assert!(sent >= 4, "only {sent} transmissions seen");

        match timeout(WAIT, responses.recv()).await.unwrap().unwrap().1 {
            Err(UaError::Timeout) => {}
            other => panic!("unexpected outcome {other:?}"),
        }
        // the transaction is gone
        assert_eq!(0, ua_a.inner.core.len().await);
    }

    #[tokio::test]
    async fn loop_detection_answers_482() {
        let agent = Arc::new(SimpleAgent::new());
        let (_ua_b, port_b) = start_ua(agent.clone(), 500).await;

        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = socket.local_addr().unwrap();
        let request = |branch: &str| {
            [
                format!("OPTIONS sip:bob@127.0.0.1:{port_b} SIP/2.0"),
                format!(
                    "Via: SIP/2.0/UDP 127.0.0.1:{};branch={branch}",
                    local.port()
                ),
                "Max-Forwards: 70".to_string(),
                format!("To: <sip:bob@127.0.0.1:{port_b}>"),
                "From: <sip:probe@127.0.0.1>;tag=looper".to_string(),
                "Call-ID: loop-test-1".to_string(),
                "CSeq: 7 OPTIONS".to_string(),
                "Content-Length: 0".to_string(),
                String::new(),
                String::new(),
            ]
            .join("\r\n")
        };

        let dest = format!("127.0.0.1:{port_b}");
        socket
            .send_to(request("z9hG4bKfirst").as_bytes(), &dest)
            .await
            .unwrap();
        let mut buf = [0u8; 4096];
        let (n, _) = timeout(WAIT, socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let first = Message::from_str(
            std::str::from_utf8(&buf[..n]).unwrap(),
        )
        .unwrap();
        assert_eq!(Some(200), first.code());

        // same identity, different branch: a loop
        socket
            .send_to(request("z9hG4bKsecond").as_bytes(), &dest)
            .await
            .unwrap();
        let (n, _) = timeout(WAIT, socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let second = Message::from_str(
            std::str::from_utf8(&buf[..n]).unwrap(),
        )
        .unwrap();
        assert_eq!(Some(482), second.code());
        assert_eq!(1, agent.handled.load(Ordering::SeqCst));
    }

    /// A busy callee answering 486 parks the INVITE server transaction in
    /// Completed; a retransmitted INVITE is answered from there without
    /// the method handler running again.
    struct DeclineAgent {
        handled: AtomicUsize,
    }

    impl UaCallback for DeclineAgent {
        fn handle_request(&self, req: &Message) -> UasDisposition {
            self.handled.fetch_add(1, Ordering::SeqCst);
            UasDisposition::Reply(Message::response_to(
                req,
                486,
                reason_phrase(486),
            ))
        }
    }

    #[tokio::test]
    async fn retransmitted_invite_answered_without_tu() {
        let agent = Arc::new(DeclineAgent {
            handled: AtomicUsize::new(0),
        });
        let (_ua_b, port_b) = start_ua(agent.clone(), 500).await;

        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local_port = socket.local_addr().unwrap().port();
        let invite = [
            format!("INVITE sip:bob@127.0.0.1:{port_b} SIP/2.0"),
            format!("Via: SIP/2.0/UDP 127.0.0.1:{local_port};branch=z9hG4bKdup1"),
            "Max-Forwards: 70".to_string(),
            format!("To: <sip:bob@127.0.0.1:{port_b}>"),
            "From: <sip:probe@127.0.0.1>;tag=duptest".to_string(),
            "Call-ID: dup-invite-1".to_string(),
            "CSeq: 1 INVITE".to_string(),
            "Contact: <sip:probe@127.0.0.1>".to_string(),
            "Content-Length: 0".to_string(),
            String::new(),
            String::new(),
        ]
        .join("\r\n");
        let dest = format!("127.0.0.1:{port_b}");

        // skip provisionals; hand back the first final response
        async fn recv_final(socket: &tokio::net::UdpSocket) -> Message {
            let mut buf = [0u8; 4096];
            loop {
                let (n, _) = socket.recv_from(&mut buf).await.unwrap();
                let msg = Message::from_str(
                    std::str::from_utf8(&buf[..n]).unwrap(),
                )
                .unwrap();
                if msg.code().unwrap_or(0) >= 200 {
                    return msg;
                }
            }
        }

        socket.send_to(invite.as_bytes(), &dest).await.unwrap();
        let first = timeout(WAIT, recv_final(&socket)).await.unwrap();
        assert_eq!(Some(486), first.code());

        socket.send_to(invite.as_bytes(), &dest).await.unwrap();
        let second = timeout(WAIT, recv_final(&socket)).await.unwrap();
        assert_eq!(Some(486), second.code());
        assert_eq!(1, agent.handled.load(Ordering::SeqCst));

        // the ACK settles the transaction
        let ack = [
            format!("ACK sip:bob@127.0.0.1:{port_b} SIP/2.0"),
            format!("Via: SIP/2.0/UDP 127.0.0.1:{local_port};branch=z9hG4bKdup1"),
            "Max-Forwards: 70".to_string(),
            first
                .headers
                .first(&HeaderName::To)
                .unwrap()
                .to_string(),
            "From: <sip:probe@127.0.0.1>;tag=duptest".to_string(),
            "Call-ID: dup-invite-1".to_string(),
            "CSeq: 1 ACK".to_string(),
            "Content-Length: 0".to_string(),
            String::new(),
            String::new(),
        ]
        .join("\r\n");
        socket.send_to(ack.as_bytes(), &dest).await.unwrap();
    }

    #[tokio::test]
    async fn non_invite_times_out_without_server() {
        let sink = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = sink.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                if sink.recv_from(&mut buf).await.is_err() {
                    break;
                }
            }
        });

        let (ua_a, _) = start_ua(Arc::new(SimpleAgent::new()), 40).await;
        let register =
            ua_a.create_request(Method::Register, &target("alice", port));
        let (cb, mut responses) = collector();
        ua_a.send_request(register, cb).await.unwrap();

        match timeout(WAIT, responses.recv()).await.unwrap().unwrap().1 {
            Err(UaError::Timeout) => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
