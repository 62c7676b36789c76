//! UAS core: the RFC 3261 §8.2 validation pipeline and response
//! construction. An
//! unmatched inbound request gets a fresh server transaction, runs the
//! pipeline (405 method check, 482 loop detection, 420 extension check,
//! each cutting the rest short), and only then reaches the application's
//! method handler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::debug;

use crate::dialog::Dialog;
use crate::headers::{Address, HeaderName, HeaderValue, Method};
use crate::ident;
use crate::message::{reason_phrase, Message, MessageError};
use crate::transaction::{
    Transaction, TransactionError, TransactionKey, TransactionType,
};
use crate::ua::{UaInner, UasDisposition};

const LOOP_WINDOW: Duration = Duration::from_secs(60);

pub(crate) async fn handle_request(ua: Arc<UaInner>, msg: Message) {
    if let Err(e) = process(&ua, msg).await {
        debug!("uas dropped request: {e}");
    }
}

async fn process(ua: &Arc<UaInner>, msg: Message) -> Result<()> {
    if !ua.callback.is_applicable(&msg) {
        return Ok(());
    }
    let method = msg
        .method()
        .cloned()
        .ok_or(MessageError::NotRequest)?;

    // an ACK that matches no transaction acknowledges a 2xx; there is
    // nothing to answer, the handler just gets told
    if method == Method::Ack {
        let _ = ua.callback.handle_request(&msg);
        return Ok(());
    }

    if method == Method::Cancel {
        return handle_cancel(ua, msg).await;
    }

    let tx = ua
        .core
        .server_transaction(&msg, Some(ua.server_tu.clone()))
        .await?;

    if let Some(rejection) = validate(ua, &msg, &method).await? {
        let rejection = finalize(ua, &msg, rejection)?;
        tx.respond(&rejection).await?;
        return Ok(());
    }

    match ua.callback.handle_request(&msg) {
        UasDisposition::Reply(resp) => send_via_tx(ua, &tx, &msg, resp).await,
        UasDisposition::Noreply => Ok(()),
    }
}

/// The ordered §8.2 checks. A `Some` is the rejection to send; the method
/// handler is never entered in that case.
async fn validate(
    ua: &Arc<UaInner>,
    msg: &Message,
    method: &Method,
) -> Result<Option<Message>> {
    let allow = ua.callback.allow(msg);
    if !allow.contains(method) {
        let mut resp = Message::response_to(msg, 405, reason_phrase(405));
        resp.headers
            .set(HeaderName::Allow, HeaderValue::Methods(allow));
        return Ok(Some(resp));
    }

    if !ua.config.no_detect_loops
        && ua.callback.detect_loops(msg)
        && is_loop(ua, msg).await?
    {
        return Ok(Some(Message::response_to(msg, 482, reason_phrase(482))));
    }

    if *method != Method::Cancel && *method != Method::Ack {
        let mut required: Vec<String> = Vec::new();
        for value in msg.headers.typed_all(&HeaderName::Require)? {
            if let HeaderValue::Tokens(tokens) = value {
                required.extend(tokens);
            }
        }
        if !required.is_empty() {
            let supported = ua.callback.supported(msg);
            let missing: Vec<String> = required
                .into_iter()
                .filter(|r| {
                    !supported.iter().any(|s| s.eq_ignore_ascii_case(r))
                })
                .collect();
            if !missing.is_empty() {
                let mut resp =
                    Message::response_to(msg, 420, reason_phrase(420));
                resp.headers.set(
                    HeaderName::Unsupported,
                    HeaderValue::Tokens(missing),
                );
                return Ok(Some(resp));
            }
        }
    }

    Ok(None)
}

/// §8.2.2.2: a request repeats a recent one in everything but its topmost
/// Via branch iff it looped back to us.
async fn is_loop(ua: &Arc<UaInner>, msg: &Message) -> Result<bool> {
    let identity = quasar_utils::sha1(&format!(
        "{}|{}|{}|{}|{}",
        msg.call_id()?,
        msg.to_addr()?,
        msg.from_addr()?,
        msg.cseq()?,
        msg.request_uri().map(|u| u.to_string()).unwrap_or_default(),
    ));
    let branch = msg.top_via()?.branch;

    let mut cache = ua.loop_cache.lock().await;
    let now = Instant::now();
    cache.retain(|_, (_, seen)| now.duration_since(*seen) < LOOP_WINDOW);
    match cache.get(&identity) {
        Some((known_branch, _)) if known_branch != &branch => Ok(true),
        _ => {
            cache.insert(identity, (branch, now));
            Ok(false)
        }
    }
}

/// §9.2: a CANCEL gets its own 200 through its own transaction, and the
/// INVITE it names answers 487 through its transaction. With nothing to
/// cancel the answer is 481.
async fn handle_cancel(ua: &Arc<UaInner>, msg: Message) -> Result<()> {
    let cancel_tx = ua
        .core
        .server_transaction(&msg, Some(ua.server_tu.clone()))
        .await?;

    let allow = ua.callback.allow(&msg);
    if !allow.contains(&Method::Cancel) {
        let mut resp = Message::response_to(&msg, 405, reason_phrase(405));
        resp.headers
            .set(HeaderName::Allow, HeaderValue::Methods(allow));
        let resp = finalize(ua, &msg, resp)?;
        cancel_tx.respond(&resp).await?;
        return Ok(());
    }

    // only the Require check is waived for CANCEL; loop detection is not
    if !ua.config.no_detect_loops
        && ua.callback.detect_loops(&msg)
        && is_loop(ua, &msg).await?
    {
        let resp = finalize(
            ua,
            &msg,
            Message::response_to(&msg, 482, reason_phrase(482)),
        )?;
        cancel_tx.respond(&resp).await?;
        return Ok(());
    }

    let via = msg.top_via()?;
    let invite_key = TransactionKey::new(
        via.branch.clone(),
        Method::Invite,
        via.host.clone(),
        via.port.unwrap_or(5060),
        TransactionType::Server,
    );
    match ua.core.find(&invite_key).await {
        Some(invite_tx) => {
            let ok = finalize(
                ua,
                &msg,
                Message::response_to(&msg, 200, reason_phrase(200)),
            )?;
            cancel_tx.respond(&ok).await?;

            let invite_req =
                { invite_tx.st.inner.lock().await.request.clone() };
            let terminated = finalize(
                ua,
                &invite_req,
                Message::response_to(&invite_req, 487, reason_phrase(487)),
            )?;
            invite_tx.respond(&terminated).await?;

            // the handler learns the request was cancelled
            let _ = ua.callback.handle_request(&msg);
        }
        None => {
            let resp = finalize(
                ua,
                &msg,
                Message::response_to(&msg, 481, reason_phrase(481)),
            )?;
            cancel_tx.respond(&resp).await?;
        }
    }
    Ok(())
}

/// Public send path: look the server transaction up by the request's key
/// and feed the response through it.
pub(crate) async fn send_response(
    ua: &Arc<UaInner>,
    req: &Message,
    resp: Message,
) -> Result<()> {
    let key = TransactionKey::from_msg(req, TransactionType::Server)?;
    let tx = ua
        .core
        .find(&key)
        .await
        .ok_or(TransactionError::NotExist)?;
    send_via_tx(ua, &tx, req, resp).await
}

async fn send_via_tx(
    ua: &Arc<UaInner>,
    tx: &Transaction,
    req: &Message,
    resp: Message,
) -> Result<()> {
    let mut resp = finalize(ua, req, resp)?;
    let code = resp.code().unwrap_or(0);

    if req.is_invite() && (200..300).contains(&code) {
        // a dialog-establishing 2xx mirrors the request's Record-Route set
        // and needs a Contact for the remote target
        if !resp.headers.contains(&HeaderName::RecordRoute) {
            for h in req.headers.all(&HeaderName::RecordRoute) {
                resp.headers.push(h.name.clone(), h.value.clone());
            }
        }
        if !resp.headers.contains(&HeaderName::Contact) {
            let local = ua
                .core
                .transport
                .local_uri(&tx.remote().transport)
                .await?;
            let mut contact_uri = local;
            contact_uri.user = Some(ua.config.user.clone());
            resp.headers.set(
                HeaderName::Contact,
                HeaderValue::Addresses(vec![Address::new(contact_uri)]),
            );
        }
        if let Ok(dialog) = Dialog::from_uas(req, &resp) {
            ua.dialogs.upsert(dialog).await;
        }
    }

    if req.method() == Some(&Method::Bye) && (200..300).contains(&code) {
        if let Some(id) = uas_dialog_id(req) {
            ua.dialogs.remove(&id).await;
        }
    }

    tx.respond(&resp).await
}

/// Automatic response headers (§8.2.6): Server, Allow and Supported when
/// absent, and a To tag on anything final.
fn finalize(
    ua: &Arc<UaInner>,
    req: &Message,
    mut resp: Message,
) -> Result<Message> {
    let code = resp.code().ok_or(MessageError::NotResponse)?;
    if !resp.headers.contains(&HeaderName::Server) {
        resp.headers.set(
            HeaderName::Server,
            HeaderValue::Text(ua.callback.server(req)),
        );
    }
    if !resp.headers.contains(&HeaderName::Allow) {
        resp.headers.set(
            HeaderName::Allow,
            HeaderValue::Methods(ua.callback.allow(req)),
        );
    }
    if !resp.headers.contains(&HeaderName::Supported) {
        let supported = ua.callback.supported(req);
        if !supported.is_empty() {
            resp.headers.set(
                HeaderName::Supported,
                HeaderValue::Tokens(supported),
            );
        }
    }
    if code >= 200 {
        let to = resp.to_addr()?;
        if to.tag.is_none() {
            let mut to = to;
            to.tag = Some(ident::tag());
            resp.headers
                .set(HeaderName::To, HeaderValue::Address(to));
        }
    }
    Ok(resp)
}

fn uas_dialog_id(req: &Message) -> Option<crate::dialog::DialogId> {
    let call_id = req.call_id().ok()?;
    let local_tag = req.to_addr().ok()?.tag?;
    let remote_tag = req.from_addr().ok()?.tag?;
    Some(crate::dialog::DialogId {
        call_id,
        local_tag,
        remote_tag,
    })
}
