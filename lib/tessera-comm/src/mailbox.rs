// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-node matching engine for inbound messages.
//!
//! Transports push [`Envelope`]s into a node's [`Inbox`]; the communicator takes them out
//! by `(source, tag)`. Taking an envelope removes it from matching, so two concurrent
//! probes can never claim the same message. Envelopes are matched in arrival order,
//! which keeps the per-(sender, tag) ordering the transports deliver in.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, oneshot};

use tessera_common::NodeId;

/// Source selector for a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Any,
    Node(NodeId),
}

impl Peer {
    #[inline]
    pub fn matches(self, source: NodeId) -> bool {
        match self {
            Peer::Any => true,
            Peer::Node(node) => node == source,
        }
    }
}

impl From<NodeId> for Peer {
    fn from(node: NodeId) -> Self {
        Peer::Node(node)
    }
}

/// One message in flight.
///
/// `matched` is the rendezvous signal: the receiver fires it when it consumes the
/// payload. Dropping the envelope unconsumed closes the channel, which the sender observes
/// as an unmatched send.
#[derive(Debug)]
pub struct Envelope {
    pub source: NodeId,
    pub tag: u32,
    pub payload: Bytes,
    pub matched: oneshot::Sender<()>,
}

impl Envelope {
    pub fn new(source: NodeId, tag: u32, payload: Bytes) -> (Self, oneshot::Receiver<()>) {
        let (matched, on_matched) = oneshot::channel();
        (
            Self {
                source,
                tag,
                payload,
                matched,
            },
            on_matched,
        )
    }
}

pub(crate) struct Mailbox {
    queue: Mutex<VecDeque<Envelope>>,
    arrived: Notify,
    closed: AtomicBool,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            arrived: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, envelope: Envelope) -> Result<(), Envelope> {
        {
            let mut queue = self.queue.lock();
            // checked under the lock so close() cannot miss an envelope
            if self.closed.load(Ordering::Acquire) {
                return Err(envelope);
            }
            queue.push_back(envelope);
        }
        self.arrived.notify_waiters();
        Ok(())
    }

    fn try_take(&self, from: Peer, tag: u32) -> Option<Envelope> {
        let mut queue = self.queue.lock();
        let position = queue
            .iter()
            .position(|e| e.tag == tag && from.matches(e.source))?;
        queue.remove(position)
    }

    /// Waits for the oldest envelope matching `(from, tag)`. Returns `None` once closed.
    pub(crate) async fn take(&self, from: Peer, tag: u32) -> Option<Envelope> {
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(envelope) = self.try_take(from, tag) {
                return Some(envelope);
            }

            notified.await;
        }
    }

    /// Rejects further pushes, fails every queued sender and wakes all waiters.
    pub(crate) fn close(&self) {
        let drained: Vec<Envelope> = {
            let mut queue = self.queue.lock();
            self.closed.store(true, Ordering::Release);
            queue.drain(..).collect()
        };
        drop(drained);
        self.arrived.notify_waiters();
    }

    pub(crate) fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Handle transports use to hand inbound envelopes to the local node.
#[derive(Clone)]
pub struct Inbox {
    mailbox: Arc<Mailbox>,
}

impl Inbox {
    pub(crate) fn new(mailbox: Arc<Mailbox>) -> Self {
        Self { mailbox }
    }

    /// Queues an envelope for matching. Gives it back if the node has shut down.
    pub fn push(&self, envelope: Envelope) -> Result<(), Envelope> {
        self.mailbox.push(envelope)
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn envelope(source: u32, tag: u32, payload: &'static [u8]) -> Envelope {
        Envelope::new(NodeId::new(source), tag, Bytes::from_static(payload)).0
    }

    #[tokio::test]
    async fn test_take_matches_source_and_tag() {
        let mailbox = Mailbox::new();
        mailbox.push(envelope(1, 7, b"a")).unwrap();
        mailbox.push(envelope(2, 7, b"b")).unwrap();
        mailbox.push(envelope(2, 8, b"c")).unwrap();

        let e = mailbox.take(Peer::Node(NodeId::new(2)), 7).await.unwrap();
        assert_eq!(&e.payload[..], b"b");
        let e = mailbox.take(Peer::Any, 8).await.unwrap();
        assert_eq!(&e.payload[..], b"c");
        let e = mailbox.take(Peer::Any, 7).await.unwrap();
        assert_eq!(&e.payload[..], b"a");
        assert_eq!(mailbox.pending(), 0);
    }

    #[tokio::test]
    async fn test_same_sender_same_tag_is_fifo() {
        let mailbox = Mailbox::new();
        for payload in [&b"1"[..], b"2", b"3"] {
            mailbox
                .push(Envelope::new(NodeId::new(0), 1, Bytes::copy_from_slice(payload)).0)
                .unwrap();
        }
        for expected in [b"1", b"2", b"3"] {
            let e = mailbox.take(Peer::Node(NodeId::new(0)), 1).await.unwrap();
            assert_eq!(&e.payload[..], expected);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_take_wakes_on_push() {
        let mailbox = Arc::new(Mailbox::new());
        let waiter = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.take(Peer::Any, 3).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        mailbox.push(envelope(0, 3, b"late")).unwrap();

        let e = timeout(Duration::from_secs(2), waiter)
            .await
            .expect("timeout")
            .unwrap()
            .unwrap();
        assert_eq!(&e.payload[..], b"late");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_wakes_waiters_and_fails_senders() {
        let mailbox = Arc::new(Mailbox::new());
        let (queued, on_matched) = Envelope::new(NodeId::new(0), 9, Bytes::new());
        mailbox.push(queued).unwrap();

        let waiter = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.take(Peer::Any, 1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        mailbox.close();

        assert!(waiter.await.unwrap().is_none());
        assert!(on_matched.await.is_err());
        assert!(mailbox.push(envelope(0, 1, b"x")).is_err());
    }
}
