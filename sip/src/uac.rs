//! UAC core: request orchestration above the transaction layer. One task
//! per logical request walks the target set and the resolved destination
//! list, consuming transaction-user events and deciding what each response
//! means: forward, redirect, authenticate, fail over, or give up.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashSet, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use indexmap::IndexMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::dialog::{Dialog, DialogId};
use crate::headers::{Address, Auth, Cseq, HeaderName, HeaderValue, Method, Via};
use crate::ident;
use crate::message::Message;
use crate::transport::Remote;
use crate::ua::{RequestId, ResponseCallback, UaError, UaInner};
use crate::uri::Uri;

pub(crate) struct PendingRequest {
    pub cancelled: AtomicBool,
    pub cancel_sent: AtomicBool,
    pub provisional: AtomicBool,
    pub current: Mutex<Option<CancelCtx>>,
}

#[derive(Clone)]
pub(crate) struct CancelCtx {
    pub attempt: Message,
    pub remote: Remote,
}

impl PendingRequest {
    fn new() -> PendingRequest {
        PendingRequest {
            cancelled: AtomicBool::new(false),
            cancel_sent: AtomicBool::new(false),
            provisional: AtomicBool::new(false),
            current: Mutex::new(None),
        }
    }
}

pub(crate) fn create_request(
    ua: &Arc<UaInner>,
    method: Method,
    to: &Address,
) -> Message {
    let mut to = to.clone();
    to.tag = None;
    let mut msg = Message::request(method.clone(), to.uri.clone());
    for route in &ua.config.route_set {
        if let Ok(address) = Address::from_str(route) {
            msg.headers.push(
                HeaderName::Route,
                HeaderValue::Addresses(vec![address]),
            );
        }
    }
    msg.headers.push(
        HeaderName::MaxForwards,
        HeaderValue::Int(ua.config.max_forwards as u32),
    );
    let mut from = Address::new(Uri::sip(
        Some(&ua.config.user),
        &ua.local_host,
    ));
    from.tag = Some(ident::tag());
    msg.headers.push(HeaderName::From, HeaderValue::Address(from));
    msg.headers.push(HeaderName::To, HeaderValue::Address(to));
    msg.headers
        .push(HeaderName::CallId, HeaderValue::Text(ident::call_id()));
    msg.headers.push(
        HeaderName::Cseq,
        HeaderValue::Cseq(Cseq { seq: 1, method }),
    );
    msg
}

pub(crate) async fn send_request(
    ua: &Arc<UaInner>,
    msg: Message,
    callback: ResponseCallback,
) -> Result<RequestId, UaError> {
    let dests = ua
        .core
        .transport
        .select_destinations(&msg)
        .await
        .map_err(|_| UaError::NoDestinations)?;
    if dests.is_empty() {
        return Err(UaError::NoDestinations);
    }

    let id = ua.next_id.fetch_add(1, Ordering::Relaxed);
    let pending = Arc::new(PendingRequest::new());
    ua.pending.lock().await.insert(id, pending.clone());

    let ua = ua.clone();
    tokio::spawn(async move {
        run_request(ua, id, msg, dests, callback, pending).await;
    });
    Ok(id)
}

pub(crate) async fn cancel_request(
    ua: &Arc<UaInner>,
    id: RequestId,
) -> Result<(), UaError> {
    let pending = ua
        .pending
        .lock()
        .await
        .get(&id)
        .cloned()
        .ok_or(UaError::NoRequest)?;
    pending.cancelled.store(true, Ordering::SeqCst);
    // §9: a CANCEL may only chase the request once a provisional response
    // proves a server is processing it; until then it stays deferred
    if pending.provisional.load(Ordering::SeqCst) {
        let _ = send_cancel(ua, &pending).await;
    }
    Ok(())
}

struct RunState {
    targets: VecDeque<Uri>,
    tried: HashSet<String>,
    auth_done: bool,
    last_response: Option<Message>,
    last_error: Option<UaError>,
}

enum AttemptOutcome {
    /// A final outcome was delivered to the callback.
    Done,
    /// Fail over to the next resolved endpoint of the same URI.
    NextDest,
    /// This target is spent; move on to the next target URI.
    NextTarget,
    /// Resubmit to the same destination with a rebuilt request.
    RetryAuth(Message),
}

async fn run_request(
    ua: Arc<UaInner>,
    id: RequestId,
    mut request: Message,
    mut dests: Vec<Remote>,
    callback: ResponseCallback,
    pending: Arc<PendingRequest>,
) {
    let mut state = RunState {
        targets: VecDeque::new(),
        tried: HashSet::new(),
        auth_done: false,
        last_response: None,
        last_error: None,
    };
    if let Some(uri) = request.request_uri() {
        state.tried.insert(uri.to_string());
    }

    'targets: loop {
        let mut di = 0;
        while di < dests.len() {
            let remote = dests[di].clone();
            let attempt = match prepare_attempt(&ua, &request, &remote).await {
                Ok(attempt) => attempt,
                Err(e) => {
                    debug!("cannot prepare attempt for {remote}: {e}");
                    di += 1;
                    continue;
                }
            };
            {
                *pending.current.lock().await = Some(CancelCtx {
                    attempt: attempt.clone(),
                    remote: remote.clone(),
                });
            }
            match run_attempt(&ua, id, &pending, &attempt, &request, &callback, &mut state)
                .await
            {
                AttemptOutcome::Done => {
                    ua.pending.lock().await.remove(&id);
                    return;
                }
                AttemptOutcome::NextDest => di += 1,
                AttemptOutcome::NextTarget => break,
                AttemptOutcome::RetryAuth(rebuilt) => request = rebuilt,
            }
        }

        // the current target is exhausted; walk the redirect target set
        loop {
            match state.targets.pop_front() {
                Some(uri) => {
                    debug!(
                        channel = %request.call_id().unwrap_or_default(),
                        "redirecting to {uri}"
                    );
                    if let crate::message::StartLine::Request {
                        uri: ruri, ..
                    } = &mut request.start
                    {
                        *ruri = uri;
                    }
                    match ua.core.transport.select_destinations(&request).await
                    {
                        Ok(found) if !found.is_empty() => {
                            dests = found;
                            continue 'targets;
                        }
                        _ => continue,
                    }
                }
                None => {
                    match (state.last_response.take(), state.last_error.take())
                    {
                        (Some(resp), _) => callback(id, Ok(resp)),
                        (None, Some(err)) => callback(id, Err(err)),
                        (None, None) => {
                            callback(id, Err(UaError::NoDestinations))
                        }
                    }
                    ua.pending.lock().await.remove(&id);
                    return;
                }
            }
        }
    }
}

async fn run_attempt(
    ua: &Arc<UaInner>,
    id: RequestId,
    pending: &Arc<PendingRequest>,
    attempt: &Message,
    request: &Message,
    callback: &ResponseCallback,
    state: &mut RunState,
) -> AttemptOutcome {
    let (tu_tx, tu_rx) = async_channel::unbounded();
    if let Err(e) = ua.core.client_transaction(attempt, tu_tx).await {
        warn!("could not start client transaction: {e}");
        return AttemptOutcome::NextDest;
    }

    while let Ok((_key, event)) = tu_rx.recv().await {
        match event {
            crate::transaction::TuEvent::Response(resp) => {
                let code = resp.code().unwrap_or(0);
                if (100..200).contains(&code) {
                    pending.provisional.store(true, Ordering::SeqCst);
                    if pending.cancelled.load(Ordering::SeqCst) {
                        let _ = send_cancel(ua, pending).await;
                    }
                    update_dialogs(ua, attempt, &resp).await;
                    callback(id, Ok(resp));
                    continue;
                }
                // once cancelled, any final response ends the request;
                // a 2xx racing the CANCEL still reaches the callback,
                // which owes the peer a BYE in that case
                if pending.cancelled.load(Ordering::SeqCst) {
                    update_dialogs(ua, attempt, &resp).await;
                    if (200..300).contains(&code) {
                        ack_2xx(ua, attempt, &resp).await;
                    }
                    callback(id, Ok(resp));
                    return AttemptOutcome::Done;
                }
                match code {
                    200..=299 => {
                        update_dialogs(ua, attempt, &resp).await;
                        ack_2xx(ua, attempt, &resp).await;
                        callback(id, Ok(resp));
                        return AttemptOutcome::Done;
                    }
                    300..=399 => {
                        // redirection: feed the target set ordered by
                        // q-value, ties kept stable
                        let mut contacts = resp.contacts().unwrap_or_default();
                        contacts.sort_by(|a, b| {
                            b.q()
                                .partial_cmp(&a.q())
                                .unwrap_or(CmpOrdering::Equal)
                        });
                        for contact in contacts {
                            let key = contact.uri.to_string();
                            if state.tried.insert(key) {
                                state.targets.push_back(contact.uri);
                            }
                        }
                        state.last_response = Some(resp);
                        return AttemptOutcome::NextTarget;
                    }
                    401 | 407 => {
                        if !state.auth_done {
                            if let Some(rebuilt) =
                                with_credentials(ua, request, &resp)
                            {
                                state.auth_done = true;
                                return AttemptOutcome::RetryAuth(rebuilt);
                            }
                        }
                        callback(id, Ok(resp));
                        return AttemptOutcome::Done;
                    }
                    408 | 503 => {
                        // RFC 3263: these mean "try the next resolved
                        // endpoint" before giving up on the URI
                        state.last_response = Some(resp);
                        return AttemptOutcome::NextDest;
                    }
                    _ => {
                        state.last_response = Some(resp);
                        return AttemptOutcome::NextTarget;
                    }
                }
            }
            crate::transaction::TuEvent::Terminated(reason) => {
                use crate::transaction::TerminateReason::*;
                match reason {
                    Normal => continue,
                    Timeout => {
                        state.last_error = Some(UaError::Timeout);
                        return AttemptOutcome::NextDest;
                    }
                    TransportError => {
                        state.last_error = Some(UaError::TransportError);
                        return AttemptOutcome::NextDest;
                    }
                }
            }
        }
    }
    AttemptOutcome::NextDest
}

/// Stamp the per-attempt parts onto a request: the resolved remote, a
/// fresh Via branch, and a Contact if the caller did not supply one.
async fn prepare_attempt(
    ua: &Arc<UaInner>,
    request: &Message,
    remote: &Remote,
) -> Result<Message> {
    let mut msg = request.clone();
    msg.remote = Some(remote.clone());
    let local = ua.core.transport.local_uri(&remote.transport).await?;
    let via = Via {
        transport: remote.transport.clone(),
        host: local.host.clone(),
        port: local.port,
        branch: ident::branch(),
        ..Default::default()
    };
    msg.headers
        .set(HeaderName::Via, HeaderValue::Via(vec![via]));
    if !msg.headers.contains(&HeaderName::Contact) {
        let mut contact_uri = local;
        contact_uri.user = Some(ua.config.user.clone());
        msg.headers.set(
            HeaderName::Contact,
            HeaderValue::Addresses(vec![Address::new(contact_uri)]),
        );
    }
    Ok(msg)
}

/// CANCEL for the in-flight attempt (§9.1): it mirrors the INVITE's
/// request URI, top Via (branch included), identity headers and Route set,
/// with its own CSeq method. Sent through its own client transaction.
pub(crate) async fn send_cancel(
    ua: &Arc<UaInner>,
    pending: &Arc<PendingRequest>,
) -> Result<(), UaError> {
    if pending.cancel_sent.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    let ctx = match pending.current.lock().await.clone() {
        Some(ctx) => ctx,
        None => return Err(UaError::NoRequest),
    };
    let attempt = &ctx.attempt;
    let uri = match attempt.request_uri() {
        Some(uri) => uri.clone(),
        None => return Err(UaError::NoRequest),
    };
    let mut cancel = Message::request(Method::Cancel, uri);
    for name in [
        HeaderName::Via,
        HeaderName::Route,
        HeaderName::MaxForwards,
        HeaderName::From,
        HeaderName::To,
        HeaderName::CallId,
    ] {
        for h in attempt.headers.all(&name) {
            cancel.headers.push(h.name.clone(), h.value.clone());
        }
    }
    if let Ok(cseq) = attempt.cseq() {
        cancel.headers.push(
            HeaderName::Cseq,
            HeaderValue::Cseq(Cseq {
                seq: cseq.seq,
                method: Method::Cancel,
            }),
        );
    }
    cancel.remote = Some(ctx.remote.clone());

    let (tu_tx, tu_rx) = async_channel::unbounded();
    tokio::spawn(async move {
        // the CANCEL's own transaction runs to completion unobserved
        while tu_rx.recv().await.is_ok() {}
    });
    ua.core
        .client_transaction(&cancel, tu_tx)
        .await
        .map_err(|_| UaError::TransportError)?;
    Ok(())
}

/// Digest answer to a 401/407 challenge, resubmitted as a new request with
/// a bumped CSeq (§8.1.3.5, §22). MD5 without qop, one retry per request.
fn with_credentials(
    ua: &Arc<UaInner>,
    request: &Message,
    resp: &Message,
) -> Option<Message> {
    let (challenge_name, answer_name) = if resp.code() == Some(401) {
        (HeaderName::WwwAuthenticate, HeaderName::Authorization)
    } else {
        (HeaderName::ProxyAuthenticate, HeaderName::ProxyAuthorization)
    };
    let challenge = match resp.headers.typed(&challenge_name).ok().flatten() {
        Some(HeaderValue::Auth(auth)) => auth,
        _ => return None,
    };
    if !challenge.scheme.eq_ignore_ascii_case("digest") {
        return None;
    }
    let realm = challenge.get("realm")?.to_string();
    let nonce = challenge.get("nonce")?.to_string();
    let (username, password) = ua.callback.credentials(&realm)?;

    let method = request.method()?.to_string();
    let uri = request.request_uri()?.to_string();
    let ha1 = quasar_utils::md5(&format!("{username}:{realm}:{password}"));
    let ha2 = quasar_utils::md5(&format!("{method}:{uri}"));
    let response = quasar_utils::md5(&format!("{ha1}:{nonce}:{ha2}"));

    let mut params = IndexMap::new();
    params.insert("username".to_string(), username);
    params.insert("realm".to_string(), realm);
    params.insert("nonce".to_string(), nonce);
    params.insert("uri".to_string(), uri);
    params.insert("response".to_string(), response);
    params.insert("algorithm".to_string(), "MD5".to_string());

    let mut msg = request.clone();
    msg.headers.set(
        answer_name,
        HeaderValue::Auth(Auth {
            scheme: "Digest".to_string(),
            params,
        }),
    );
    let cseq = request.cseq().ok()?;
    msg.headers.set(
        HeaderName::Cseq,
        HeaderValue::Cseq(Cseq {
            seq: cseq.seq + 1,
            method: cseq.method,
        }),
    );
    Some(msg)
}

/// ACK for a 2xx final INVITE response (§13.2.2.4). The transaction is
/// already gone; the UA core builds the ACK from the confirmed dialog on
/// a fresh branch and hands it straight to the transport. Nothing tracks
/// it and nothing retransmits it.
async fn ack_2xx(ua: &Arc<UaInner>, attempt: &Message, resp: &Message) {
    if attempt.method() != Some(&Method::Invite) {
        return;
    }
    let dialog_id = match ack_dialog_id(attempt, resp) {
        Some(id) => id,
        None => return,
    };
    let mut ack = match ua.dialogs.create_request(&dialog_id, Method::Ack).await
    {
        Some(ack) => ack,
        None => return,
    };
    ack.headers.push(
        HeaderName::MaxForwards,
        HeaderValue::Int(ua.config.max_forwards as u32),
    );

    // route by the dialog's remote target; fall back to where the 2xx
    // came from
    let remote = match ua.core.transport.select_destinations(&ack).await {
        Ok(dests) if !dests.is_empty() => dests.into_iter().next().unwrap(),
        _ => match attempt.remote.clone() {
            Some(remote) => remote,
            None => return,
        },
    };
    let local = match ua.core.transport.local_uri(&remote.transport).await {
        Ok(local) => local,
        Err(e) => {
            warn!("no local endpoint for 2xx ack: {e}");
            return;
        }
    };
    let via = Via {
        transport: remote.transport.clone(),
        host: local.host,
        port: local.port,
        branch: ident::branch(),
        ..Default::default()
    };
    ack.headers.set(HeaderName::Via, HeaderValue::Via(vec![via]));
    ack.remote = Some(remote);

    if let Err(e) = ua.core.transport.send(&ack).await {
        warn!(
            channel = %ack.call_id().unwrap_or_default(),
            "2xx ack send failed: {e}"
        );
    }
}

fn ack_dialog_id(attempt: &Message, resp: &Message) -> Option<DialogId> {
    let call_id = attempt.call_id().ok()?;
    let local_tag = attempt.from_addr().ok()?.tag?;
    let remote_tag = resp.to_addr().ok()?.tag?;
    Some(DialogId {
        call_id,
        local_tag,
        remote_tag,
    })
}

/// Dialog bookkeeping on the client side: INVITE 1xx-with-tag opens an
/// early dialog, 2xx confirms it and refreshes the remote target, a BYE
/// 2xx tears it down.
async fn update_dialogs(ua: &Arc<UaInner>, attempt: &Message, resp: &Message) {
    let code = resp.code().unwrap_or(0);
    if attempt.method() == Some(&Method::Bye) && (200..300).contains(&code) {
        if let Some(id) = uac_dialog_id(attempt) {
            ua.dialogs.remove(&id).await;
        }
        return;
    }
    if attempt.method() != Some(&Method::Invite) {
        return;
    }
    if !(101..300).contains(&code) {
        return;
    }
    match Dialog::from_uac_response(attempt, resp) {
        Ok(dialog) => ua.dialogs.upsert(dialog).await,
        // a provisional without a To tag establishes nothing
        Err(_) => {}
    }
}

fn uac_dialog_id(request: &Message) -> Option<DialogId> {
    let call_id = request.call_id().ok()?;
    let local_tag = request.from_addr().ok()?.tag?;
    let remote_tag = request.to_addr().ok()?.tag?;
    Some(DialogId {
        call_id,
        local_tag,
        remote_tag,
    })
}
