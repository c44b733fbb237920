// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! TCP transport for a static group of ranks.
//!
//! Every rank listens on its own entry of the peer table and lazily opens one outbound
//! connection per destination. A send becomes a `Message` frame carrying a sequence number
//! that is unique for this transport; the sender parks the envelope's rendezvous signal in
//! `pending` under that number. The receiving transport pushes the message into its inbox
//! and answers with `Ack` once a receive consumed it, or `Nack` once it was discarded.
//! Payloads over [`MAX_PAYLOAD_SIZE`] are refused before they are queued. When a writer
//! exits, the sends it never wrote fail; if it exited because the connection broke, every
//! send to that peer still awaiting an answer fails with them.

use anyhow::Result;
use dashmap::DashMap;
use futures::SinkExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tessera_common::NodeId;

use super::framing::{Frame, FrameType, MAX_PAYLOAD_SIZE, TcpFrameCodec};
use super::listener::TcpListener;
use crate::channel::Channel;
use crate::mailbox::{Envelope, Inbox};
use crate::transport::{Transport, TransportError};

/// Socket and connection tuning for [`TcpTransport`].
#[derive(Debug, Clone)]
pub struct TcpOptions {
    /// Extra connection attempts after the first one fails.
    pub connect_retries: u32,
    pub retry_interval: Duration,
    pub nodelay: bool,
    /// Applied to both the send and receive buffers.
    pub socket_buffer_size: usize,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            connect_retries: 50,
            retry_interval: Duration::from_millis(100),
            nodelay: true,
            socket_buffer_size: 1_048_576,
        }
    }
}

/// TCP transport for one rank of the group.
///
/// Connection state lives in `DashMap`s shared with the listener and writer tasks.
pub struct TcpTransport {
    shared: Arc<TcpShared>,
    prebound: Mutex<Option<std::net::TcpListener>>,
}

pub(super) struct TcpShared {
    peers: Vec<SocketAddr>,
    options: TcpOptions,

    local: OnceLock<NodeId>,
    inbox: OnceLock<Inbox>,
    runtime: OnceLock<Handle>,

    connections: DashMap<NodeId, ConnectionHandle>,
    pending: DashMap<u64, PendingReply>,
    next_seq: AtomicU64,
    next_connection: AtomicU64,

    cancel_token: CancellationToken,
}

/// Handle to a connection's writer task
#[derive(Clone)]
struct ConnectionHandle {
    id: u64,
    tx: flume::Sender<Frame>,
}

/// Rendezvous signal of a message that has left this node and awaits its `Ack`/`Nack`.
struct PendingReply {
    dest: NodeId,
    matched: oneshot::Sender<()>,
}

impl TcpTransport {
    pub fn builder() -> TcpTransportBuilder {
        TcpTransportBuilder::new()
    }

    /// Number of group members in the peer table.
    pub fn group_size(&self) -> usize {
        self.shared.peers.len()
    }

    /// Sends still waiting for the remote side to consume or discard them.
    pub fn in_flight(&self) -> usize {
        self.shared.pending.len()
    }
}

impl Transport for TcpTransport {
    fn key(&self) -> &'static str {
        "tcp"
    }

    fn start(&self, local: NodeId, inbox: Inbox) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let bind_addr = *self
                .shared
                .peers
                .get(local.as_usize())
                .ok_or(TransportError::PeerNotRegistered(local))?;

            self.shared
                .local
                .set(local)
                .map_err(|_| TransportError::AlreadyStarted)?;
            self.shared.inbox.set(inbox).ok();
            let runtime = Handle::current();
            self.shared.runtime.set(runtime.clone()).ok();

            let prebound = self.prebound.lock().take();
            let listener = TcpListener::bind(bind_addr, prebound, self.shared.clone()).await?;
            info!(
                "TCP transport for {} listening on {}",
                local,
                listener.local_addr()?
            );
            runtime.spawn(listener.serve());

            Ok(())
        })
    }

    fn deliver(&self, dest: NodeId, envelope: Envelope) -> Result<(), TransportError> {
        let local = self.shared.local()?;

        if dest == local {
            let inbox = self.shared.inbox.get().ok_or(TransportError::NotStarted)?;
            return inbox.push(envelope).map_err(|_| TransportError::Closed);
        }

        if self.shared.cancel_token.is_cancelled() {
            return Err(TransportError::Closed);
        }

        if envelope.payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(TransportError::PayloadTooLarge {
                size: envelope.payload.len(),
                max: MAX_PAYLOAD_SIZE as usize,
            });
        }

        let Envelope {
            tag,
            payload,
            matched,
            ..
        } = envelope;

        // registered before the frame is queued so the answer always finds it
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        self.shared
            .pending
            .insert(seq, PendingReply { dest, matched });

        let frame = Frame::message(local, tag, seq, payload);
        if let Err(e) = self.shared.enqueue(dest, frame) {
            self.shared.pending.remove(&seq);
            return Err(e);
        }
        Ok(())
    }

    fn shutdown(&self) {
        if self.shared.cancel_token.is_cancelled() {
            return;
        }
        info!("Shutting down TCP transport");
        self.shared.cancel_token.cancel();

        self.shared.connections.clear();
        self.shared.pending.clear();
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shared.cancel_token.cancel();
    }
}

impl TcpShared {
    fn local(&self) -> Result<NodeId, TransportError> {
        self.local.get().copied().ok_or(TransportError::NotStarted)
    }

    pub(super) fn options(&self) -> &TcpOptions {
        &self.options
    }

    pub(super) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Queues `frame` on the writer for `dest`, connecting first if needed.
    fn enqueue(self: &Arc<Self>, dest: NodeId, frame: Frame) -> Result<(), TransportError> {
        if self.cancel_token.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let handle = self.get_or_create_connection(dest)?;
        match handle.tx.send(frame) {
            Ok(()) => Ok(()),
            Err(flume::SendError(frame)) => {
                // the writer exited after the lookup; replace it once
                self.drop_connection(dest, handle.id);
                let handle = self.get_or_create_connection(dest)?;
                handle
                    .tx
                    .send(frame)
                    .map_err(|_| TransportError::Connection {
                        node: dest,
                        reason: "writer task exited".to_string(),
                    })
            }
        }
    }

    /// Get or create a connection to a peer (lazy initialization)
    fn get_or_create_connection(
        self: &Arc<Self>,
        dest: NodeId,
    ) -> Result<ConnectionHandle, TransportError> {
        // Fast path: connection exists
        if let Some(handle) = self.connections.get(&dest) {
            return Ok(handle.clone());
        }

        let addr = *self
            .peers
            .get(dest.as_usize())
            .ok_or(TransportError::PeerNotRegistered(dest))?;
        let runtime = self.runtime.get().ok_or(TransportError::NotStarted)?;

        let handle = self
            .connections
            .entry(dest)
            .or_insert_with(|| {
                let (tx, rx) = flume::unbounded();
                let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
                runtime.spawn(connection_writer_task(self.clone(), dest, addr, id, rx));
                debug!("Created new connection to {} ({})", dest, addr);
                ConnectionHandle { id, tx }
            })
            .clone();

        Ok(handle)
    }

    fn drop_connection(&self, dest: NodeId, id: u64) {
        self.connections.remove_if(&dest, |_, handle| handle.id == id);
    }

    /// Fails the sends whose message frames never reached the socket.
    fn fail_unwritten(&self, dest: NodeId, seqs: &[u64]) {
        let failed = seqs
            .iter()
            .filter(|seq| {
                self.pending
                    .remove_if(seq, |_, reply| reply.dest == dest)
                    .is_some()
            })
            .count();
        if failed > 0 {
            warn!("Failed {} unsent messages to {}", failed, dest);
        }
    }

    /// Fails every send to `dest` still waiting for an answer.
    fn fail_pending(&self, dest: NodeId) {
        let before = self.pending.len();
        self.pending.retain(|_, reply| reply.dest != dest);
        let failed = before.saturating_sub(self.pending.len());
        if failed > 0 {
            warn!("Failed {} in-flight sends to {}", failed, dest);
        }
    }

    /// Route a decoded frame from `peer_addr`.
    pub(super) fn route_frame(self: &Arc<Self>, frame: Frame, peer_addr: SocketAddr) {
        if frame.source.as_usize() >= self.peers.len() {
            warn!(
                "Dropping {:?} frame from {} claiming unknown source {}",
                frame.frame_type, peer_addr, frame.source
            );
            return;
        }

        match frame.frame_type {
            FrameType::Message => self.accept_message(frame),
            FrameType::Ack => {
                match self
                    .pending
                    .remove_if(&frame.seq, |_, reply| reply.dest == frame.source)
                {
                    Some((_, reply)) => {
                        let _ = reply.matched.send(());
                    }
                    None => debug!("Ack for unknown message {} from {}", frame.seq, frame.source),
                }
            }
            FrameType::Nack => {
                if self
                    .pending
                    .remove_if(&frame.seq, |_, reply| reply.dest == frame.source)
                    .is_some()
                {
                    debug!("{} discarded message {}", frame.source, frame.seq);
                }
            }
        }
    }

    /// Hands an inbound message to the local inbox and answers the sender once a receive
    /// has consumed or discarded it.
    fn accept_message(self: &Arc<Self>, frame: Frame) {
        let (Some(inbox), Ok(local)) = (self.inbox.get(), self.local()) else {
            warn!("Message from {} before the transport started", frame.source);
            return;
        };

        let Frame {
            source,
            tag,
            seq,
            payload,
            ..
        } = frame;

        if let Err(e) = Channel::from_wire_tag(tag) {
            warn!("Rejecting message {} from {}: {}", seq, source, e);
            if let Err(e) = self.enqueue(source, Frame::reply(local, seq, false)) {
                debug!("Could not answer message {} from {}: {}", seq, source, e);
            }
            return;
        }

        let (envelope, on_matched) = Envelope::new(source, tag, payload);
        // a rejected envelope is dropped here, which answers with a Nack below
        let _ = inbox.push(envelope);

        let shared = self.clone();
        tokio::spawn(async move {
            let consumed = on_matched.await.is_ok();
            if let Err(e) = shared.enqueue(source, Frame::reply(local, seq, consumed)) {
                debug!("Could not answer message {} from {}: {}", seq, source, e);
            }
        });
    }
}

/// Connection writer task
///
/// Owns the outbound socket to one peer. When it exits the connection is forgotten and the
/// messages still queued fail. Messages already written keep waiting for their answer,
/// which arrives over the peer's own connection, unless this one broke.
async fn connection_writer_task(
    shared: Arc<TcpShared>,
    dest: NodeId,
    addr: SocketAddr,
    id: u64,
    rx: flume::Receiver<Frame>,
) {
    let result = write_frames(&shared, dest, addr, &rx).await;
    shared.drop_connection(dest, id);

    let unwritten: Vec<u64> = rx
        .drain()
        .filter(|frame| frame.frame_type == FrameType::Message)
        .map(|frame| frame.seq)
        .collect();
    shared.fail_unwritten(dest, &unwritten);

    if let Err(e) = result {
        warn!("Connection to {} ({}) failed: {}", dest, addr, e);
        shared.fail_pending(dest);
    }
    debug!("Connection to {} ({}) closed", dest, addr);
}

async fn write_frames(
    shared: &TcpShared,
    dest: NodeId,
    addr: SocketAddr,
    rx: &flume::Receiver<Frame>,
) -> io::Result<()> {
    let stream = connect_with_retry(addr, &shared.options, &shared.cancel_token).await?;
    configure_stream(&stream, &shared.options, addr);

    let mut framed = FramedWrite::new(stream, TcpFrameCodec::new());
    debug!("Connected to {}", addr);

    loop {
        tokio::select! {
            next = rx.recv_async() => match next {
                Ok(frame) if !frame.is_encodable() => {
                    warn!("Dropping oversized message {} to {}", frame.seq, dest);
                    if frame.frame_type == FrameType::Message {
                        shared.fail_unwritten(dest, &[frame.seq]);
                    }
                }
                Ok(frame) => framed.send(frame).await?,
                Err(_) => break,
            },
            _ = shared.cancel_token.cancelled() => {
                debug!("Writer task for {} cancelled, draining queue", addr);
                while let Ok(frame) = rx.try_recv() {
                    if framed.send(frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = framed.flush().await;
    Ok(())
}

async fn connect_with_retry(
    addr: SocketAddr,
    options: &TcpOptions,
    cancel_token: &CancellationToken,
) -> io::Result<TcpStream> {
    let mut attempt = 0;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt < options.connect_retries => {
                attempt += 1;
                debug!(
                    "Connect to {} failed (attempt {}/{}): {}",
                    addr, attempt, options.connect_retries, e
                );
                tokio::select! {
                    _ = tokio::time::sleep(options.retry_interval) => {}
                    _ = cancel_token.cancelled() => {
                        return Err(io::Error::new(
                            io::ErrorKind::Interrupted,
                            "transport shut down",
                        ));
                    }
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Applies nodelay, keep-alive and buffer sizes. Failures are logged, not fatal.
pub(super) fn configure_stream(stream: &TcpStream, options: &TcpOptions, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(options.nodelay) {
        warn!("Failed to set TCP_NODELAY on {}: {}", peer, e);
    }

    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_tcp_keepalive(
        &socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(60))
            .with_interval(Duration::from_secs(10)),
    ) {
        warn!("Failed to set keepalive on {}: {}", peer, e);
    }

    if let Err(e) = sock.set_send_buffer_size(options.socket_buffer_size) {
        warn!("Failed to set send buffer size on {}: {}", peer, e);
    }
    if let Err(e) = sock.set_recv_buffer_size(options.socket_buffer_size) {
        warn!("Failed to set receive buffer size on {}: {}", peer, e);
    }
}

/// Builder for TcpTransport
pub struct TcpTransportBuilder {
    peers: Vec<SocketAddr>,
    listener: Option<std::net::TcpListener>,
    options: TcpOptions,
}

impl TcpTransportBuilder {
    pub fn new() -> Self {
        Self {
            peers: Vec::new(),
            listener: None,
            options: TcpOptions::default(),
        }
    }

    /// Listening address of every rank, indexed by rank.
    pub fn peers(mut self, peers: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.peers = peers.into_iter().collect();
        self
    }

    /// Serve on an already bound listener instead of binding this rank's peer address.
    pub fn listener(mut self, listener: std::net::TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn options(mut self, options: TcpOptions) -> Self {
        self.options = options;
        self
    }

    pub fn connect_retries(mut self, retries: u32) -> Self {
        self.options.connect_retries = retries;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.options.retry_interval = interval;
        self
    }

    /// Build the TcpTransport
    pub fn build(self) -> Result<TcpTransport> {
        if self.peers.is_empty() {
            anyhow::bail!("at least one peer is required");
        }
        if self.options.retry_interval.is_zero() {
            anyhow::bail!("retry_interval must be non-zero");
        }

        Ok(TcpTransport {
            shared: Arc::new(TcpShared {
                peers: self.peers,
                options: self.options,
                local: OnceLock::new(),
                inbox: OnceLock::new(),
                runtime: OnceLock::new(),
                connections: DashMap::new(),
                pending: DashMap::new(),
                next_seq: AtomicU64::new(0),
                next_connection: AtomicU64::new(0),
                cancel_token: CancellationToken::new(),
            }),
            prebound: Mutex::new(self.listener),
        })
    }
}

impl Default for TcpTransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}
