// Copyright (C) 2023 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request/response correlation.
//!
//! RTSP responses carry no ordering guarantee beyond the `CSeq` echo, so the
//! correlator matches purely by `CSeq`: requests may be pipelined and
//! responses may complete out of order. Anything that can't be matched to a
//! waiting request (late responses after a timeout, server-initiated
//! requests, interleaved data) goes to the connection's event channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use log::debug;
use tokio::sync::{mpsc, oneshot};

use super::Event;
use crate::msg::{Message, Response};
use crate::{Error, ErrorInt, ReceivedMessage, RtspMessageContext};

type Slot = oneshot::Sender<Result<(RtspMessageContext, Response), Error>>;
pub(super) type SlotReceiver = oneshot::Receiver<Result<(RtspMessageContext, Response), Error>>;

pub(super) struct Correlator {
    /// The next `CSeq` to assign. Values are strictly increasing from 1.
    next_cseq: AtomicU32,

    pending: Mutex<Pending>,
    event_tx: mpsc::UnboundedSender<Event>,
}

struct Pending {
    slots: HashMap<u32, Slot>,

    /// Set once the connection dies; registrations after that fail
    /// immediately rather than waiting forever.
    dead: Option<Error>,
}

impl Correlator {
    pub(super) fn new(event_tx: mpsc::UnboundedSender<Event>) -> Self {
        Correlator {
            next_cseq: AtomicU32::new(1),
            pending: Mutex::new(Pending {
                slots: HashMap::new(),
                dead: None,
            }),
            event_tx,
        }
    }

    pub(super) fn next_cseq(&self) -> u32 {
        self.next_cseq.fetch_add(1, Ordering::Relaxed)
    }

    /// Creates a pending slot for `cseq`, to be completed by [`dispatch`].
    pub(super) fn register(&self, cseq: u32) -> Result<SlotReceiver, Error> {
        let mut pending = self.pending.lock().unwrap();
        if let Some(ref e) = pending.dead {
            return Err(e.clone());
        }
        if pending.slots.contains_key(&cseq) {
            return Err(wrap!(ErrorInt::CSeqCollision { cseq }));
        }
        let (tx, rx) = oneshot::channel();
        pending.slots.insert(cseq, tx);
        Ok(rx)
    }

    /// Abandons a pending slot, after a timeout or caller cancellation. A
    /// response arriving later becomes unsolicited.
    pub(super) fn forget(&self, cseq: u32) {
        self.pending.lock().unwrap().slots.remove(&cseq);
    }

    /// Routes a received message: responses to their waiting request,
    /// everything else to the event channel.
    pub(super) fn dispatch(&self, msg: ReceivedMessage) {
        let ctx = msg.ctx;
        match msg.msg {
            Message::Response(response) => {
                let slot = response
                    .cseq()
                    .and_then(|cseq| self.pending.lock().unwrap().slots.remove(&cseq));
                match slot {
                    Some(tx) => {
                        if tx.send(Ok((ctx, response))).is_err() {
                            debug!("dropping response for a request whose caller went away");
                        }
                    }
                    None => {
                        let _ = self.event_tx.send(Event::UnmatchedResponse(response));
                    }
                }
            }
            Message::Request(request) => {
                let _ = self.event_tx.send(Event::ServerRequest(request));
            }
            Message::Data { channel, body } => {
                let _ = self.event_tx.send(Event::Data { channel, body });
            }
        }
    }

    /// Fails every pending request with `error` and marks the correlator
    /// dead. The first error wins; later calls only drain new slots.
    pub(super) fn cancel_all(&self, error: Error) {
        let mut pending = self.pending.lock().unwrap();
        if pending.dead.is_none() {
            pending.dead = Some(error.clone());
        }
        for (_, tx) in pending.slots.drain() {
            let _ = tx.send(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{HeaderMap, StatusCode, Version};
    use crate::ConnectionContext;
    use bytes::Bytes;

    fn correlator() -> (Correlator, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Correlator::new(tx), rx)
    }

    fn response_with_cseq(cseq: u32) -> ReceivedMessage {
        let mut headers = HeaderMap::new();
        headers.set("CSeq", cseq.to_string());
        ReceivedMessage {
            ctx: RtspMessageContext::dummy(),
            msg: Message::Response(Response::new(
                Version::V1_0,
                StatusCode::OK,
                "OK",
                headers,
                Bytes::new(),
            )),
        }
    }

    #[test]
    fn cseq_values_are_contiguous_from_one() {
        let (c, _rx) = correlator();
        assert_eq!((c.next_cseq(), c.next_cseq(), c.next_cseq()), (1, 2, 3));
    }

    #[tokio::test]
    async fn matches_out_of_order_responses() {
        let (c, _rx) = correlator();
        let slot1 = c.register(1).unwrap();
        let slot2 = c.register(2).unwrap();
        c.dispatch(response_with_cseq(2));
        c.dispatch(response_with_cseq(1));
        let (_, r2) = slot2.await.unwrap().unwrap();
        let (_, r1) = slot1.await.unwrap().unwrap();
        assert_eq!(r1.cseq(), Some(1));
        assert_eq!(r2.cseq(), Some(2));
    }

    #[test]
    fn register_rejects_collision() {
        let (c, _rx) = correlator();
        let _slot = c.register(7).unwrap();
        assert!(c.register(7).is_err());
    }

    #[tokio::test]
    async fn unmatched_response_becomes_event() {
        let (c, mut rx) = correlator();
        c.dispatch(response_with_cseq(42));
        match rx.recv().await {
            Some(Event::UnmatchedResponse(r)) => assert_eq!(r.cseq(), Some(42)),
            o => panic!("{o:?}"),
        }
    }

    #[tokio::test]
    async fn forgotten_slot_makes_late_response_unsolicited() {
        let (c, mut rx) = correlator();
        let _slot = c.register(3).unwrap();
        c.forget(3);
        c.dispatch(response_with_cseq(3));
        assert!(matches!(rx.recv().await, Some(Event::UnmatchedResponse(_))));
    }

    #[tokio::test]
    async fn cancel_all_fails_pending_and_future_registrations() {
        let (c, _rx) = correlator();
        let slot = c.register(1).unwrap();
        c.cancel_all(wrap!(ErrorInt::ConnectionClosed {
            conn_ctx: ConnectionContext::dummy(),
        }));
        let err = slot.await.unwrap().unwrap_err();
        assert!(err.is_connection_dead());
        assert!(c.register(2).unwrap_err().is_connection_dead());
    }
}
