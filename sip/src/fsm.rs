use anyhow::{Error, Result};
use std::time::Duration;
use strum_macros::{self, EnumString};
use thiserror::Error;
use tracing::debug;

use crate::headers::Method;
use crate::transaction::{
    TerminateReason, Transaction, TransactionType, TxInner,
};

#[derive(Debug, Error)]
pub enum FsmError {
    #[error("invalid state")]
    InvalidState,
    #[error("invalid input")]
    InvalidInput,
}

#[derive(PartialEq, Clone, Debug, strum_macros::Display)]
pub enum Input {
    No,

    Req,
    Ack,
    Resp1xx,
    Resp2xx,
    Resp300to699,

    Timer100,

    TimerA,
    TimerB,
    TimerD,

    TimerE,
    TimerF,
    TimerK,

    TimerG,
    TimerH,
    TimerI,
    TimerJ,

    TransportError,
    Shutdown,
}

#[derive(strum_macros::Display, EnumString, PartialEq, Eq, Clone, Debug)]
pub enum State {
    Trying,
    Calling,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

fn terminate_reason(input: &Input) -> TerminateReason {
    match input {
        Input::TimerB | Input::TimerF | Input::TimerH => {
            TerminateReason::Timeout
        }
        Input::TransportError => TerminateReason::TransportError,
        _ => TerminateReason::Normal,
    }
}

/// Drive a transaction's state machine with one input. Inputs that make no
/// sense in the current state (stale timers, duplicate events after
/// termination) are dropped. On entry into Terminated the transaction is
/// removed from the table and the TU gets `{tx, key, {terminated, reason}}`.
pub async fn spin(tx: &Transaction, input: Input) -> Result<(), Error> {
    let mut inner = tx.st.inner.lock().await;
    let mut input = input;
    loop {
        let state = inner.state.clone();
        if state == State::Terminated {
            return Ok(());
        }
        let invite = tx.st.key.method == Method::Invite;
        let result = if input == Input::Shutdown {
            Ok((State::Terminated, Input::No))
        } else {
            match (invite, &tx.st.key.tx_type) {
                (true, TransactionType::Client) => {
                    InviteClient::action(tx, &mut inner, &state, &input).await
                }
                (true, TransactionType::Server) => {
                    InviteServer::action(tx, &mut inner, &state, &input).await
                }
                (false, TransactionType::Client) => {
                    NonInviteClient::action(tx, &mut inner, &state, &input).await
                }
                (false, TransactionType::Server) => {
                    NonInviteServer::action(tx, &mut inner, &state, &input).await
                }
            }
        };
        let (new_state, next) = match result {
            Ok(step) => step,
            Err(e) if matches!(
                e.downcast_ref::<FsmError>(),
                Some(FsmError::InvalidInput)
            ) =>
            {
                debug!(
                    "transaction {} ignoring {} in {}",
                    tx.st.key, input, state
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        inner.state = new_state.clone();
        if new_state == State::Terminated {
            let reason = terminate_reason(&input);
            let tu = inner.tu.take();
            drop(inner);
            tx.core.remove(&tx.st.key).await;
            tx.notify_terminated(tu, reason).await;
            return Ok(());
        }
        if next == Input::No {
            break;
        }
        input = next;
    }

    Ok(())
}

//                               |INVITE from TU
//             Timer A fires     |INVITE sent
//             Reset A,          V                      Timer B fires
//             INVITE sent +-----------+                or Transport Err.
//               +---------|           |---------------+inform TU
//               |         |  Calling  |               |
//               +-------->|           |-------------->|
//                         +-----------+ 2xx           |
//                            |  |       2xx to TU     |
//                            |  |1xx                  |
//    300-699 +---------------+  |1xx to TU            |
//   ACK sent |                  |                     |
//resp. to TU |                  1xx                   |
//            |                  1xx to TU             |
//            |                  +-----------+         |
//            |                  |           |         |
//            |       1xx        |Proceeding |-------->|
//            |       1xx to TU  |           | 2xx     |
//            |      +-----------+           | 2xx to TU
//            |      |           +-----------+         |
//            |      +-----------|  |                  |
//            |                  |  | 300-699          |
//            |                  |  | ACK sent,        |
//            |                  |  | resp. to TU      |
//            |                  |  |                  |
//            |                  |  V                  |
//            |            +-----------+               |
//            |            |           |               |
//            |            | Completed |               |
//            +----------->|           |               |
//                         +-----------+               |
//           300-699         |    |                    |
//           ACK sent        |    | Timer D fires      |
//           +---------------+    | -                  |
//           |               ^    |                    |
//           +---------------+    V                    |
//                         +-----------+               |
//                         |           |               |
//                         | Terminated|<--------------+
//                         |           |
//                         +-----------+
//
//                  INVITE client transaction (RFC 3261 §17.1.1)
#[derive(Default, Debug)]
pub struct InviteClient;

impl InviteClient {
    pub async fn action(
        tx: &Transaction,
        inner: &mut TxInner,
        state: &State,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match state {
            State::Calling => Self::calling_act(tx, inner, input).await,
            State::Proceeding => Self::proceeding_act(tx, inner, input).await,
            State::Completed => Self::completed_act(tx, inner, input).await,
            _ => Err(FsmError::InvalidState)?,
        }
    }

    async fn calling_act(
        tx: &Transaction,
        inner: &mut TxInner,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match input {
            Input::Resp1xx => {
                tx.passup(inner).await;
                Ok((State::Proceeding, Input::No))
            }
            Input::Resp2xx => {
                // the TU takes over: it constructs and sends the ACK
                tx.passup(inner).await;
                Ok((State::Terminated, Input::No))
            }
            Input::Resp300to699 => {
                Ok((State::Completed, Self::act_300(tx, inner).await))
            }
            Input::TimerA => {
                Ok((State::Calling, Self::resend(tx, inner).await))
            }
            Input::TimerB => Ok((State::Terminated, Input::No)),
            Input::TransportError => Ok((State::Terminated, Input::No)),
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    async fn proceeding_act(
        tx: &Transaction,
        inner: &mut TxInner,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match input {
            Input::Resp1xx => {
                tx.passup(inner).await;
                Ok((State::Proceeding, Input::No))
            }
            Input::Resp2xx => {
                tx.passup(inner).await;
                Ok((State::Terminated, Input::No))
            }
            Input::Resp300to699 => {
                Ok((State::Completed, Self::act_300(tx, inner).await))
            }
            // retransmission stops once a provisional arrives
            Input::TimerA => Ok((State::Proceeding, Input::No)),
            Input::TimerB => Ok((State::Terminated, Input::No)),
            Input::TransportError => Ok((State::Terminated, Input::No)),
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    async fn completed_act(
        tx: &Transaction,
        inner: &mut TxInner,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match input {
            Input::Resp300to699 => {
                // duplicate final response: answer it with the same ACK
                if tx.send_ack(inner).await.is_err() {
                    return Ok((State::Completed, Input::TransportError));
                }
                Ok((State::Completed, Input::No))
            }
            Input::TimerD => Ok((State::Terminated, Input::No)),
            Input::TimerB => Ok((State::Completed, Input::No)),
            Input::TransportError => Ok((State::Terminated, Input::No)),
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    async fn resend(tx: &Transaction, inner: &mut TxInner) -> Input {
        if tx.send_request(inner).await.is_err() {
            return Input::TransportError;
        }
        inner.resend_count += 1;
        let mut duration = tx.core.config.t1();
        for _ in 0..inner.resend_count {
            duration *= 2;
        }
        tx.register_timer(duration, Input::TimerA);
        Input::No
    }

    async fn act_300(tx: &Transaction, inner: &mut TxInner) -> Input {
        tx.passup(inner).await;
        if tx.send_ack(inner).await.is_err() {
            return Input::TransportError;
        }
        let duration = if tx.st.reliable {
            Duration::from_secs(0)
        } else {
            Duration::from_secs(32)
        };
        tx.register_timer(duration, Input::TimerD);
        Input::No
    }
}

//                               |INVITE
//                               |pass INV to TU
//            INVITE             V send 100 if TU won't in 200 ms
//            send response+-----------+
//                +--------|           |--------+ 101-199 from TU
//                |        | Proceeding|        | send response
//                +------->|           |<-------+
//                         |           |          Transport Err.
//                         |           |--------------------------+
//                         +-----------+                          |
//            300-699 from TU |    |2xx from TU                   |
//            send response   |    |send response                 |
//                            |    +------------------+           |
//                            |                       |           |
//            INVITE          V          Timer G fires|           |
//            send response+-----------+ send response|           |
//                +--------|           |--------+     |           |
//                |        | Completed |        |     |           |
//                +------->|           |<-------+     |           |
//                         +-----------+              |           |
//                            |    |                  |           |
//                        ACK |    |                  |           |
//                        -   |    +------------------>-----------|
//                            |      Timer H fires    |           |
//                            V      or Transport Err.|           |
//                         +-----------+ inform TU    |           |
//                         |           |              |           |
//                         | Confirmed |              |           |
//                         |           |              |           |
//                         +-----------+              |           |
//                               |                    |           |
//                               |Timer I fires       |           |
//                               |-                   |           |
//                               |                    |           |
//                               V                    V           V
//                         +------------+
//                         |            |
//                         | Terminated |
//                         |            |
//                         +------------+
//
//                 INVITE server transaction (RFC 3261 §17.2.1)
#[derive(Default, Debug)]
pub struct InviteServer;

impl InviteServer {
    pub async fn action(
        tx: &Transaction,
        inner: &mut TxInner,
        state: &State,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match state {
            State::Proceeding => Self::proceeding_act(tx, inner, input).await,
            State::Completed => Self::completed_act(tx, inner, input).await,
            State::Confirmed => Self::confirmed_act(input),
            _ => Err(FsmError::InvalidState)?,
        }
    }

    async fn proceeding_act(
        tx: &Transaction,
        inner: &mut TxInner,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match input {
            Input::Req => {
                let _ = tx.send_last_response(inner).await;
                Ok((State::Proceeding, Input::No))
            }
            Input::Timer100 => {
                let _ = tx.send_trying(inner).await;
                Ok((State::Proceeding, Input::No))
            }
            Input::Resp1xx => {
                if tx.send_last_response(inner).await.is_err() {
                    return Ok((State::Proceeding, Input::TransportError));
                }
                Ok((State::Proceeding, Input::No))
            }
            Input::Resp2xx => {
                let _ = tx.send_last_response(inner).await;
                Ok((State::Terminated, Input::No))
            }
            Input::Resp300to699 => {
                Ok((State::Completed, Self::act_300(tx, inner).await))
            }
            Input::TransportError => Ok((State::Terminated, Input::No)),
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    async fn completed_act(
        tx: &Transaction,
        inner: &mut TxInner,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match input {
            Input::Req => {
                // retransmitted INVITE: re-emit the final response without
                // re-entering the TU
                let _ = tx.send_last_response(inner).await;
                Ok((State::Completed, Input::No))
            }
            Input::TimerG => {
                Ok((State::Completed, Self::retransmit_final(tx, inner).await))
            }
            Input::Ack => {
                let duration = if tx.st.reliable {
                    Duration::from_secs(0)
                } else {
                    tx.core.config.t4()
                };
                tx.register_timer(duration, Input::TimerI);
                Ok((State::Confirmed, Input::No))
            }
            Input::TimerH => Ok((State::Terminated, Input::No)),
            Input::TransportError => Ok((State::Terminated, Input::No)),
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    fn confirmed_act(input: &Input) -> Result<(State, Input), Error> {
        match input {
            Input::TimerI => Ok((State::Terminated, Input::No)),
            // stragglers are absorbed
            Input::Ack | Input::Req | Input::TimerG => {
                Ok((State::Confirmed, Input::No))
            }
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    async fn act_300(tx: &Transaction, inner: &mut TxInner) -> Input {
        if tx.send_last_response(inner).await.is_err() {
            return Input::TransportError;
        }
        if !tx.st.reliable {
            tx.register_timer(tx.core.config.t1(), Input::TimerG);
        }
        tx.register_timer(64 * tx.core.config.t1(), Input::TimerH);
        Input::No
    }

    async fn retransmit_final(tx: &Transaction, inner: &mut TxInner) -> Input {
        if tx.send_last_response(inner).await.is_err() {
            return Input::TransportError;
        }
        inner.resend_count += 1;
        let mut duration = tx.core.config.t1();
        for _ in 0..inner.resend_count {
            duration *= 2;
        }
        duration = duration.min(tx.core.config.t2());
        tx.register_timer(duration, Input::TimerG);
        Input::No
    }
}

//                               |Request from TU
//                               |send request
//           Timer E             V
//           send request  +-----------+
//               +---------|           |-------------------+
//               |         |  Trying   |  Timer F          |
//               +-------->|           |  or Transport Err.|
//                         +-----------+  inform TU        |
//            200-699         |  |                         |
//            resp. to TU     |  |1xx                      |
//            +---------------+  |resp. to TU              |
//            |                  |                         |
//            |   Timer E        V       Timer F           |
//            |   send req +-----------+ or Transport Err. |
//            |  +---------|           | inform TU         |
//            |  |         |Proceeding |------------------>|
//            |  +-------->|           |-----+             |
//            |            +-----------+     |1xx          |
//            |              |      ^        |resp to TU   |
//            | 200-699      |      +--------+             |
//            | resp. to TU  |                             |
//            |              |                             |
//            |              V                             |
//            |            +-----------+                   |
//            |            |           |                   |
//            |            | Completed |                   |
//            |            |           |                   |
//            |            +-----------+                   |
//            |              ^   |                         |
//            |              |   | Timer K                 |
//            +--------------+   | -                       |
//                               |                         |
//                               V                         |
//                         +-----------+                   |
//                         |           |                   |
//                         | Terminated|<------------------+
//                         |           |
//                         +-----------+
//
//                non-INVITE client transaction (RFC 3261 §17.1.2)
#[derive(Default, Debug)]
pub struct NonInviteClient;

impl NonInviteClient {
    pub async fn action(
        tx: &Transaction,
        inner: &mut TxInner,
        state: &State,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match state {
            State::Trying => Self::trying_act(tx, inner, input).await,
            State::Proceeding => Self::proceeding_act(tx, inner, input).await,
            State::Completed => Self::completed_act(input),
            _ => Err(FsmError::InvalidState)?,
        }
    }

    async fn trying_act(
        tx: &Transaction,
        inner: &mut TxInner,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match input {
            Input::TimerE => {
                Ok((State::Trying, Self::trying_resend(tx, inner).await))
            }
            Input::Resp1xx => {
                tx.passup(inner).await;
                Ok((State::Proceeding, Input::No))
            }
            Input::Resp2xx | Input::Resp300to699 => {
                Ok((State::Completed, Self::act_final(tx, inner).await))
            }
            Input::TimerF => Ok((State::Terminated, Input::No)),
            Input::TransportError => Ok((State::Terminated, Input::No)),
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    async fn proceeding_act(
        tx: &Transaction,
        inner: &mut TxInner,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match input {
            Input::TimerE => {
                Ok((State::Proceeding, Self::proceeding_resend(tx, inner).await))
            }
            Input::Resp1xx => {
                tx.passup(inner).await;
                Ok((State::Proceeding, Input::No))
            }
            Input::Resp2xx | Input::Resp300to699 => {
                Ok((State::Completed, Self::act_final(tx, inner).await))
            }
            Input::TimerF => Ok((State::Terminated, Input::No)),
            Input::TransportError => Ok((State::Terminated, Input::No)),
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    fn completed_act(input: &Input) -> Result<(State, Input), Error> {
        match input {
            Input::TimerK => Ok((State::Terminated, Input::No)),
            // late responses and stale timers are absorbed
            Input::Resp1xx
            | Input::Resp2xx
            | Input::Resp300to699
            | Input::TimerE
            | Input::TimerF => Ok((State::Completed, Input::No)),
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    async fn trying_resend(tx: &Transaction, inner: &mut TxInner) -> Input {
        if tx.send_request(inner).await.is_err() {
            return Input::TransportError;
        }
        inner.resend_count += 1;
        let mut duration = tx.core.config.t1();
        for _ in 0..inner.resend_count {
            duration *= 2;
        }
        duration = duration.min(tx.core.config.t2());
        tx.register_timer(duration, Input::TimerE);
        Input::No
    }

    async fn proceeding_resend(tx: &Transaction, inner: &mut TxInner) -> Input {
        if tx.send_request(inner).await.is_err() {
            return Input::TransportError;
        }
        tx.register_timer(tx.core.config.t2(), Input::TimerE);
        Input::No
    }

    async fn act_final(tx: &Transaction, inner: &mut TxInner) -> Input {
        tx.passup(inner).await;
        let duration = if tx.st.reliable {
            Duration::from_secs(0)
        } else {
            tx.core.config.t4()
        };
        tx.register_timer(duration, Input::TimerK);
        Input::No
    }
}

//                               |Request received
//                               |pass to TU
//                               V
//                         +-----------+
//                         |           |
//                         | Trying    |-------------+
//                         |           |             |
//                         +-----------+             |200-699 from TU
//                               |                   |send response
//                               |1xx from TU        |
//                               |send response      |
//                               |                   |
//            Request            V      1xx from TU  |
//            send response+-----------+send response|
//                +--------|           |--------+    |
//                |        | Proceeding|        |    |
//                +------->|           |<-------+    |
//         +<--------------|           |             |
//         |Trnsprt Err    +-----------+             |
//         |Inform TU            |                   |
//         |                     |                   |
//         |                     |200-699 from TU    |
//         |                     |send response      |
//         |  Request            V                   |
//         |  send response+-----------+             |
//         |      +--------|           |             |
//         |      |        | Completed |<------------+
//         |      +------->|           |
//         +<--------------|           |
//         |Trnsprt Err    +-----------+
//         |Inform TU            |
//         |                     |Timer J fires
//         |                     |-
//         |                     |
//         |                     V
//         |               +-----------+
//         |               |           |
//         +-------------->| Terminated|
//                         |           |
//                         +-----------+
//
//                non-INVITE server transaction (RFC 3261 §17.2.2)
#[derive(Default, Debug)]
pub struct NonInviteServer;

impl NonInviteServer {
    pub async fn action(
        tx: &Transaction,
        inner: &mut TxInner,
        state: &State,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match state {
            State::Trying => Self::trying_act(tx, inner, input).await,
            State::Proceeding => Self::proceeding_act(tx, inner, input).await,
            State::Completed => Self::completed_act(tx, inner, input).await,
            _ => Err(FsmError::InvalidState)?,
        }
    }

    async fn trying_act(
        tx: &Transaction,
        inner: &mut TxInner,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match input {
            // duplicates before any response are absorbed
            Input::Req => Ok((State::Trying, Input::No)),
            Input::Resp1xx => {
                if tx.send_last_response(inner).await.is_err() {
                    return Ok((State::Trying, Input::TransportError));
                }
                Ok((State::Proceeding, Input::No))
            }
            Input::Resp2xx | Input::Resp300to699 => {
                Ok((State::Completed, Self::act_final(tx, inner).await))
            }
            Input::TransportError => Ok((State::Terminated, Input::No)),
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    async fn proceeding_act(
        tx: &Transaction,
        inner: &mut TxInner,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match input {
            Input::Req => {
                let _ = tx.send_last_response(inner).await;
                Ok((State::Proceeding, Input::No))
            }
            Input::Resp1xx => {
                if tx.send_last_response(inner).await.is_err() {
                    return Ok((State::Proceeding, Input::TransportError));
                }
                Ok((State::Proceeding, Input::No))
            }
            Input::Resp2xx | Input::Resp300to699 => {
                Ok((State::Completed, Self::act_final(tx, inner).await))
            }
            Input::TransportError => Ok((State::Terminated, Input::No)),
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    async fn completed_act(
        tx: &Transaction,
        inner: &mut TxInner,
        input: &Input,
    ) -> Result<(State, Input), Error> {
        match input {
            Input::Req => {
                let _ = tx.send_last_response(inner).await;
                Ok((State::Completed, Input::No))
            }
            Input::TimerJ => Ok((State::Terminated, Input::No)),
            Input::TransportError => Ok((State::Terminated, Input::No)),
            // a late 1xx or duplicate final from the TU changes nothing
            Input::Resp1xx | Input::Resp2xx | Input::Resp300to699 => {
                Ok((State::Completed, Input::No))
            }
            _ => Err(FsmError::InvalidInput)?,
        }
    }

    async fn act_final(tx: &Transaction, inner: &mut TxInner) -> Input {
        if tx.send_last_response(inner).await.is_err() {
            return Input::TransportError;
        }
        let duration = if tx.st.reliable {
            Duration::from_secs(0)
        } else {
            64 * tx.core.config.t1()
        };
        tx.register_timer(duration, Input::TimerJ);
        Input::No
    }
}
