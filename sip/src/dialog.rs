use std::collections::HashMap;
use std::fmt;

use anyhow::{Error, Result};
use tokio::sync::Mutex;

use crate::headers::{Address, Cseq, HeaderName, HeaderValue, Method};
use crate::message::{Message, MessageError};
use crate::uri::Uri;

/// (Call-ID, local tag, remote tag) names a dialog.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            quasar_utils::sha1(&format!(
                "{}{}{}",
                &self.call_id, &self.local_tag, &self.remote_tag
            ))
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
}

#[derive(Clone, Debug)]
pub struct Dialog {
    pub id: DialogId,
    pub state: DialogState,
    pub local_seq: u32,
    pub remote_seq: Option<u32>,
    pub local_uri: Address,
    pub remote_uri: Address,
    /// Latest Contact of the peer; in-dialog requests go here.
    pub remote_target: Uri,
    /// Proxies captured from Record-Route, stored in the order in-dialog
    /// requests will traverse them.
    pub route_set: Vec<Uri>,
    pub secure: bool,
}

impl Dialog {
    /// Dialog seen from the caller, built from an INVITE and a
    /// dialog-establishing response (1xx with a To tag, or 2xx). The route
    /// set is the response's Record-Route reversed (§12.1.2).
    pub fn from_uac_response(req: &Message, resp: &Message) -> Result<Dialog> {
        let from = req.from_addr()?;
        let to = resp.to_addr()?;
        let local_tag = from
            .tag
            .clone()
            .ok_or(MessageError::MissingHeader("From tag"))?;
        let remote_tag = to
            .tag
            .clone()
            .ok_or(MessageError::MissingHeader("To tag"))?;
        let remote_target = resp
            .contacts()?
            .into_iter()
            .next()
            .map(|c| c.uri)
            .unwrap_or_else(|| to.uri.clone());
        let route_set = resp
            .record_routes()?
            .into_iter()
            .rev()
            .map(|a| a.uri)
            .collect();
        let code = resp.code().unwrap_or(0);
        Ok(Dialog {
            id: DialogId {
                call_id: req.call_id()?,
                local_tag,
                remote_tag,
            },
            state: if code < 200 {
                DialogState::Early
            } else {
                DialogState::Confirmed
            },
            local_seq: req.cseq()?.seq,
            remote_seq: None,
            local_uri: strip_tag(from),
            remote_uri: strip_tag(to),
            remote_target,
            route_set,
            secure: req.request_uri().map(|u| u.is_sips()).unwrap_or(false),
        })
    }

    /// Dialog seen from the callee, built from the INVITE and the 2xx that
    /// answered it. The route set keeps the request's Record-Route order
    /// (§12.1.1).
    pub fn from_uas(req: &Message, resp: &Message) -> Result<Dialog> {
        let from = req.from_addr()?;
        let to = resp.to_addr()?;
        let local_tag = to
            .tag
            .clone()
            .ok_or(MessageError::MissingHeader("To tag"))?;
        let remote_tag = from
            .tag
            .clone()
            .ok_or(MessageError::MissingHeader("From tag"))?;
        let remote_target = req
            .contacts()?
            .into_iter()
            .next()
            .map(|c| c.uri)
            .ok_or(MessageError::MissingHeader("Contact"))?;
        let route_set =
            req.record_routes()?.into_iter().map(|a| a.uri).collect();
        Ok(Dialog {
            id: DialogId {
                call_id: req.call_id()?,
                local_tag,
                remote_tag,
            },
            state: DialogState::Confirmed,
            local_seq: 0,
            remote_seq: Some(req.cseq()?.seq),
            local_uri: strip_tag(to),
            remote_uri: strip_tag(from),
            remote_target,
            route_set,
            secure: req.request_uri().map(|u| u.is_sips()).unwrap_or(false),
        })
    }

    pub fn confirm(&mut self) {
        self.state = DialogState::Confirmed;
    }

    pub fn next_local_seq(&mut self) -> u32 {
        self.local_seq += 1;
        self.local_seq
    }

    /// Per-direction CSeq must be strictly monotonic; duplicates and
    /// out-of-order arrivals are rejected.
    pub fn remote_seq_valid(&mut self, seq: u32) -> bool {
        if let Some(current) = self.remote_seq {
            if seq <= current {
                return false;
            }
        }
        self.remote_seq = Some(seq);
        true
    }

    /// In-dialog request per §12.2.1.1: remote target in the request URI
    /// and the route set as Route headers (loose routing), tags from the
    /// dialog, next local CSeq.
    pub fn create_request(&mut self, method: Method) -> Result<Message, Error> {
        let mut msg = Message::request(method.clone(), self.remote_target.clone());
        for route in &self.route_set {
            msg.headers.push(
                HeaderName::Route,
                HeaderValue::Addresses(vec![Address::new(route.clone())]),
            );
        }
        let mut from = self.local_uri.clone();
        from.tag = Some(self.id.local_tag.clone());
        let mut to = self.remote_uri.clone();
        to.tag = Some(self.id.remote_tag.clone());
        msg.headers.push(HeaderName::From, HeaderValue::Address(from));
        msg.headers.push(HeaderName::To, HeaderValue::Address(to));
        msg.headers.push(
            HeaderName::CallId,
            HeaderValue::Text(self.id.call_id.clone()),
        );
        // an ACK answers the INVITE under its own CSeq number; everything
        // else advances the sequence
        let seq = if method == Method::Ack {
            self.local_seq
        } else {
            self.next_local_seq()
        };
        msg.headers.push(
            HeaderName::Cseq,
            HeaderValue::Cseq(Cseq { seq, method }),
        );
        Ok(msg)
    }
}

fn strip_tag(mut address: Address) -> Address {
    address.tag = None;
    address
}

/// The UA's dialog table; access is serialized through this owner.
#[derive(Default)]
pub struct DialogTable {
    dialogs: Mutex<HashMap<DialogId, Dialog>>,
}

impl DialogTable {
    pub fn new() -> DialogTable {
        DialogTable::default()
    }

    /// Insert a dialog, or fold an update into the stored one: a 2xx
    /// confirms an early dialog and refreshes the remote target.
    pub async fn upsert(&self, dialog: Dialog) {
        let mut table = self.dialogs.lock().await;
        match table.get_mut(&dialog.id) {
            Some(existing) => {
                if dialog.state == DialogState::Confirmed {
                    existing.confirm();
                }
                existing.remote_target = dialog.remote_target;
            }
            None => {
                table.insert(dialog.id.clone(), dialog);
            }
        }
    }

    pub async fn get(&self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.lock().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.lock().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.dialogs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.dialogs.lock().await.is_empty()
    }

    /// Build an in-dialog request, bumping the stored local CSeq.
    pub async fn create_request(
        &self,
        id: &DialogId,
        method: Method,
    ) -> Option<Message> {
        let mut table = self.dialogs.lock().await;
        let dialog = table.get_mut(id)?;
        dialog.create_request(method).ok()
    }

    /// Validate and record the CSeq of an inbound in-dialog request.
    pub async fn check_remote_seq(&self, id: &DialogId, seq: u32) -> bool {
        let mut table = self.dialogs.lock().await;
        match table.get_mut(id) {
            Some(dialog) => dialog.remote_seq_valid(seq),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn invite_and_200() -> (Message, Message) {
        let req = Message::from_str(
            &[
                "INVITE sip:bob@biloxi.com SIP/2.0",
                "Via: SIP/2.0/UDP 10.0.0.9:5090;branch=z9hG4bKnashds8",
                "Max-Forwards: 70",
                "Contact: <sip:alice@10.0.0.9:5090>",
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
        .unwrap();
        let resp = Message::from_str(
            &[
                "SIP/2.0 200 OK",
                "Via: SIP/2.0/UDP 10.0.0.9:5090;branch=z9hG4bKnashds8",
                "Record-Route: <sip:p2.example.com;lr>",
                "Record-Route: <sip:p1.example.com;lr>",
                "Contact: <sip:bob@192.0.2.4>",
                "To: <sip:bob@biloxi.com>;tag=a6c85cf",
                "From: <sip:alice@atlanta.com>;tag=1928301774",
                "Call-ID: a84b4c76e66710",
                "CSeq: 314159 INVITE",
                "Content-Length: 0",
                "",
                "",
            ]
            .join("\r\n"),
        )
        .unwrap();
        (req, resp)
    }

    #[test]
    fn uac_dialog_captures_route_set_reversed() {
        let (req, resp) = invite_and_200();
        let dialog = Dialog::from_uac_response(&req, &resp).unwrap();
        assert_eq!(DialogState::Confirmed, dialog.state);
        assert_eq!("1928301774", dialog.id.local_tag);
        assert_eq!("a6c85cf", dialog.id.remote_tag);
        assert_eq!("192.0.2.4", dialog.remote_target.host);
        let hosts: Vec<&str> = dialog
            .route_set
            .iter()
            .map(|u| u.host.as_str())
            .collect();
        assert_eq!(vec!["p1.example.com", "p2.example.com"], hosts);
    }

    #[test]
    fn uas_dialog_keeps_route_set_order() {
        let (req2, resp) = invite_and_200();
        // fold the record-routes into the request for the UAS view
        let mut req = req2;
        for h in resp.headers.all(&HeaderName::RecordRoute) {
            req.headers.push(h.name.clone(), h.value.clone());
        }
        let dialog = Dialog::from_uas(&req, &resp).unwrap();
        assert_eq!("a6c85cf", dialog.id.local_tag);
        assert_eq!("1928301774", dialog.id.remote_tag);
        assert_eq!(Some(314159), dialog.remote_seq);
        let hosts: Vec<&str> = dialog
            .route_set
            .iter()
            .map(|u| u.host.as_str())
            .collect();
        assert_eq!(vec!["p2.example.com", "p1.example.com"], hosts);
    }

    #[test]
    fn in_dialog_request_uses_remote_target_and_next_cseq() {
        let (req, resp) = invite_and_200();
        let mut dialog = Dialog::from_uac_response(&req, &resp).unwrap();
        let bye = dialog.create_request(Method::Bye).unwrap();
        assert_eq!("192.0.2.4", bye.request_uri().unwrap().host);
        assert_eq!(314160, bye.cseq().unwrap().seq);
        assert_eq!(Method::Bye, bye.cseq().unwrap().method);
        assert_eq!(
            Some("a6c85cf".to_string()),
            bye.to_addr().unwrap().tag
        );
        assert_eq!(2, bye.routes().unwrap().len());

        let bye2 = dialog.create_request(Method::Bye).unwrap();
        assert_eq!(314161, bye2.cseq().unwrap().seq);
    }

    #[test]
    fn remote_seq_is_strictly_monotonic() {
        let (req, resp) = invite_and_200();
        let mut req_rr = req;
        for h in resp.headers.all(&HeaderName::RecordRoute) {
            req_rr.headers.push(h.name.clone(), h.value.clone());
        }
        let mut dialog = Dialog::from_uas(&req_rr, &resp).unwrap();
        assert!(!dialog.remote_seq_valid(314159));
        assert!(dialog.remote_seq_valid(314160));
        assert!(!dialog.remote_seq_valid(314160));
    }
}
