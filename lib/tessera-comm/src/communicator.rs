// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Point-to-point messaging between the ranks of a static group.
//!
//! Every send is a rendezvous: it completes only after the destination has consumed the
//! message. [`Communicator::send_sync`] suspends the caller for that long;
//! [`Communicator::send_async`] returns an [`AsyncRequest`] immediately and the caller
//! waits on it later.
//!
//! Receiving is a two-step protocol. [`Communicator::probe`] waits for a matching message
//! and hands back a [`Receipt`] that reports the sender and exact byte count without
//! consuming the payload; [`Communicator::receive`] then consumes it into a buffer of that
//! size. The probed message is withdrawn from matching, so no other receive can claim it
//! in between.

use bytes::Bytes;
use std::sync::Arc;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::oneshot;
use tracing::{debug, info};

use tessera_common::NodeId;

use crate::channel::Channel;
use crate::error::CommError;
use crate::mailbox::{Envelope, Inbox, Mailbox, Peer};
use crate::transport::Transport;

/// Rank that coordinates [`Communicator::barrier`].
const BARRIER_ROOT: NodeId = NodeId::new(0);

/// A node's handle on the process group.
///
/// Constructed once per process and shared (usually behind an `Arc`) by every component
/// that talks to other nodes. Dropping it closes the local mailbox and shuts the transport
/// down.
pub struct Communicator {
    rank: NodeId,
    group_size: u32,
    mailbox: Arc<Mailbox>,
    transport: Arc<dyn Transport>,
}

impl Communicator {
    /// Joins the group as `rank` over `transport`.
    ///
    /// Fails with [`CommError::Initialization`] unless called from a multi-threaded tokio
    /// runtime: sends and receives issued from independent tasks must be able to make
    /// progress at the same time.
    pub async fn new(
        rank: NodeId,
        group_size: u32,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, CommError> {
        require_multi_thread_runtime()?;

        if rank.as_u32() >= group_size {
            return Err(CommError::InvalidNode {
                node: rank,
                group_size,
            });
        }

        let mailbox = Arc::new(Mailbox::new());
        transport.start(rank, Inbox::new(mailbox.clone())).await?;

        info!(
            "{} joined group of {} over {} transport",
            rank,
            group_size,
            transport.key()
        );

        Ok(Self {
            rank,
            group_size,
            mailbox,
            transport,
        })
    }

    pub fn rank(&self) -> NodeId {
        self.rank
    }

    pub fn group_size(&self) -> u32 {
        self.group_size
    }

    /// Sends `bytes` to `node` and waits until the receiver has consumed them.
    pub async fn send_sync(
        &self,
        bytes: impl Into<Bytes>,
        node: NodeId,
        channel: Channel,
    ) -> Result<(), CommError> {
        self.send_async(bytes, node, channel).wait().await
    }

    /// Starts a send to `node` without waiting for it.
    ///
    /// The returned request must be passed to [`wait_async`](Self::wait_async) exactly
    /// once, which ownership of the request enforces.
    pub fn send_async(
        &self,
        bytes: impl Into<Bytes>,
        node: NodeId,
        channel: Channel,
    ) -> AsyncRequest {
        let state = match self.post(node, channel, bytes.into()) {
            Ok(on_matched) => RequestState::Pending(on_matched),
            Err(error) => RequestState::Failed(error),
        };
        AsyncRequest {
            node,
            channel,
            state,
        }
    }

    /// Waits for a request started by [`send_async`](Self::send_async).
    pub async fn wait_async(&self, request: AsyncRequest) -> Result<(), CommError> {
        request.wait().await
    }

    /// Receives a message of exactly `buffer.len()` bytes from `node`.
    ///
    /// A message of any other size is consumed and rejected with
    /// [`CommError::SizeMismatch`]; its sender observes the send as unmatched.
    pub async fn recv_sync(
        &self,
        buffer: &mut [u8],
        node: NodeId,
        channel: Channel,
    ) -> Result<(), CommError> {
        let receipt = self.probe(Peer::Node(node), channel).await?;
        self.receive(buffer, receipt)
    }

    /// Waits for a message from `from` on `channel` and reports it without consuming it.
    pub async fn probe(&self, from: Peer, channel: Channel) -> Result<Receipt, CommError> {
        if let Peer::Node(node) = from {
            self.check_node(node)?;
        }
        let envelope = self
            .mailbox
            .take(from, channel.wire_tag())
            .await
            .ok_or(CommError::Closed)?;
        Ok(Receipt { envelope, channel })
    }

    /// Consumes a probed message into `buffer`, which must be exactly its size.
    pub fn receive(&self, buffer: &mut [u8], receipt: Receipt) -> Result<(), CommError> {
        receipt.complete_into(buffer)
    }

    /// Consumes a probed message into a freshly allocated buffer of its exact size.
    pub fn receive_bytes(&self, receipt: Receipt) -> Bytes {
        receipt.complete()
    }

    /// Blocks until every node of the group has entered the barrier.
    ///
    /// Rank 0 collects one arrival from every other rank, then releases them all.
    pub async fn barrier(&self) -> Result<(), CommError> {
        if self.group_size == 1 {
            return Ok(());
        }

        if self.rank == BARRIER_ROOT {
            for _ in 1..self.group_size {
                let arrival = self.probe(Peer::Any, Channel::Barrier).await?;
                debug!("Barrier arrival from {}", arrival.source());
                arrival.complete();
            }
            let releases: Vec<AsyncRequest> = (1..self.group_size)
                .map(|rank| self.send_async(Bytes::new(), NodeId::new(rank), Channel::Barrier))
                .collect();
            wait_all(releases).await
        } else {
            self.send_sync(Bytes::new(), BARRIER_ROOT, Channel::Barrier)
                .await?;
            self.recv_sync(&mut [], BARRIER_ROOT, Channel::Barrier)
                .await
        }
    }

    /// Number of inbound messages waiting to be matched.
    pub fn pending(&self) -> usize {
        self.mailbox.pending()
    }

    /// Closes the mailbox and stops the transport. Blocked probes fail with
    /// [`CommError::Closed`]. Idempotent; also run on drop.
    pub fn shutdown(&self) {
        self.mailbox.close();
        self.transport.shutdown();
    }

    fn post(
        &self,
        node: NodeId,
        channel: Channel,
        payload: Bytes,
    ) -> Result<oneshot::Receiver<()>, CommError> {
        self.check_node(node)?;
        let (envelope, on_matched) = Envelope::new(self.rank, channel.wire_tag(), payload);
        self.transport.deliver(node, envelope)?;
        Ok(on_matched)
    }

    pub(crate) fn check_node(&self, node: NodeId) -> Result<(), CommError> {
        if node.as_u32() < self.group_size {
            Ok(())
        } else {
            Err(CommError::InvalidNode {
                node,
                group_size: self.group_size,
            })
        }
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("rank", &self.rank)
            .field("group_size", &self.group_size)
            .field("transport", &self.transport.key())
            .finish()
    }
}

fn require_multi_thread_runtime() -> Result<(), CommError> {
    let handle = Handle::try_current()
        .map_err(|e| CommError::Initialization(format!("no tokio runtime: {e}")))?;
    match handle.runtime_flavor() {
        RuntimeFlavor::MultiThread => Ok(()),
        flavor => Err(CommError::Initialization(format!(
            "concurrent send/receive needs a multi-threaded runtime, found {flavor:?}"
        ))),
    }
}

/// Waits for every request, returning the first failure after all have finished.
pub(crate) async fn wait_all(requests: Vec<AsyncRequest>) -> Result<(), CommError> {
    let mut outcome = Ok(());
    for request in requests {
        let result = request.wait().await;
        if outcome.is_ok() {
            outcome = result;
        }
    }
    outcome
}

/// A message that has been matched by a probe but not yet consumed.
///
/// Dropping a receipt without consuming it discards the message and fails the sender's
/// rendezvous.
#[derive(Debug)]
pub struct Receipt {
    envelope: Envelope,
    channel: Channel,
}

impl Receipt {
    pub fn source(&self) -> NodeId {
        self.envelope.source
    }

    pub fn byte_count(&self) -> usize {
        self.envelope.payload.len()
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    fn complete_into(self, buffer: &mut [u8]) -> Result<(), CommError> {
        if buffer.len() != self.byte_count() {
            return Err(CommError::SizeMismatch {
                expected: buffer.len(),
                actual: self.byte_count(),
            });
        }
        buffer.copy_from_slice(&self.envelope.payload);
        let _ = self.envelope.matched.send(());
        Ok(())
    }

    fn complete(self) -> Bytes {
        let _ = self.envelope.matched.send(());
        self.envelope.payload
    }
}

/// Handle on a send started with [`Communicator::send_async`].
///
/// The message is already queued with the transport when the request is created; waiting
/// only observes the rendezvous.
#[derive(Debug)]
#[must_use = "an async request must be waited on"]
pub struct AsyncRequest {
    node: NodeId,
    channel: Channel,
    state: RequestState,
}

#[derive(Debug)]
enum RequestState {
    Pending(oneshot::Receiver<()>),
    Failed(CommError),
}

impl AsyncRequest {
    /// Destination of the send.
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub async fn wait(self) -> Result<(), CommError> {
        match self.state {
            RequestState::Pending(on_matched) => {
                on_matched.await.map_err(|_| CommError::Unmatched {
                    node: self.node,
                    channel: self.channel,
                })
            }
            RequestState::Failed(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::local::LocalFabric;
    use std::time::Duration;
    use tokio::time::timeout;

    fn node(rank: u32) -> NodeId {
        NodeId::new(rank)
    }

    #[tokio::test]
    async fn test_current_thread_runtime_is_rejected() {
        let fabric = LocalFabric::new();
        let result = Communicator::new(node(0), 1, fabric.transport()).await;
        assert!(matches!(result, Err(CommError::Initialization(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rank_outside_group_is_rejected() {
        let fabric = LocalFabric::new();
        let result = Communicator::new(node(2), 2, fabric.transport()).await;
        assert!(matches!(result, Err(CommError::InvalidNode { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_sync_waits_for_receiver() {
        let group = LocalFabric::group(2).await.unwrap();
        let (a, b) = (&group[0], &group[1]);

        let send = a.send_sync(Bytes::from_static(b"hello"), node(1), Channel::User(1));
        tokio::pin!(send);

        // no receive posted yet: the send must not complete
        assert!(
            timeout(Duration::from_millis(50), send.as_mut())
                .await
                .is_err()
        );

        let mut buffer = [0u8; 5];
        b.recv_sync(&mut buffer, node(0), Channel::User(1))
            .await
            .unwrap();
        assert_eq!(&buffer, b"hello");

        timeout(Duration::from_secs(2), send)
            .await
            .expect("send should complete once matched")
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_probe_does_not_consume() {
        let group = LocalFabric::group(2).await.unwrap();
        let (a, b) = (&group[0], &group[1]);

        let request = a.send_async(vec![1u8, 2, 3, 4, 5, 6, 7], node(1), Channel::User(9));

        let receipt = b.probe(Peer::Any, Channel::User(9)).await.unwrap();
        assert_eq!(receipt.source(), node(0));
        assert_eq!(receipt.byte_count(), 7);
        assert_eq!(receipt.channel(), Channel::User(9));

        let mut buffer = vec![0u8; receipt.byte_count()];
        b.receive(&mut buffer, receipt).unwrap();
        assert_eq!(buffer, vec![1, 2, 3, 4, 5, 6, 7]);

        a.wait_async(request).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_size_mismatch_fails_both_sides() {
        let group = LocalFabric::group(2).await.unwrap();
        let (a, b) = (&group[0], &group[1]);

        let request = a.send_async(vec![0u8; 8], node(1), Channel::User(2));
        let mut small = [0u8; 4];
        let result = b.recv_sync(&mut small, node(0), Channel::User(2)).await;
        assert!(matches!(
            result,
            Err(CommError::SizeMismatch {
                expected: 4,
                actual: 8
            })
        ));
        assert!(matches!(
            request.wait().await,
            Err(CommError::Unmatched { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalid_destination() {
        let group = LocalFabric::group(2).await.unwrap();
        let result = group[0].send_sync(Bytes::new(), node(5), Channel::User(0)).await;
        assert!(matches!(result, Err(CommError::InvalidNode { .. })));
        let request = group[0].send_async(Bytes::new(), node(5), Channel::User(0));
        assert_eq!(request.node(), node(5));
        assert!(request.wait().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_self_send_loops_back() {
        let group = LocalFabric::group(1).await.unwrap();
        let me = &group[0];
        let request = me.send_async(Bytes::from_static(b"me"), node(0), Channel::User(4));
        let mut buffer = [0u8; 2];
        me.recv_sync(&mut buffer, node(0), Channel::User(4))
            .await
            .unwrap();
        assert_eq!(&buffer, b"me");
        request.wait().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_unblocks_probe() {
        let group = LocalFabric::group(1).await.unwrap();
        let me = Arc::new(group.into_iter().next().unwrap());
        let waiter = {
            let me = me.clone();
            tokio::spawn(async move { me.probe(Peer::Any, Channel::User(0)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        me.shutdown();
        let result = timeout(Duration::from_secs(2), waiter)
            .await
            .expect("timeout")
            .unwrap();
        assert!(matches!(result, Err(CommError::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_barrier_releases_all_ranks() {
        let group: Vec<Arc<Communicator>> = LocalFabric::group(4)
            .await
            .unwrap()
            .into_iter()
            .map(Arc::new)
            .collect();

        let mut tasks = Vec::new();
        for comm in &group {
            let comm = comm.clone();
            tasks.push(tokio::spawn(async move {
                comm.barrier().await?;
                comm.barrier().await
            }));
        }
        for task in tasks {
            timeout(Duration::from_secs(5), task)
                .await
                .expect("barrier timed out")
                .unwrap()
                .unwrap();
        }
    }
}
