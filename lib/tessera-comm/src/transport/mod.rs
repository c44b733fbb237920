// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transports move [`Envelope`]s between the nodes of a static group.
//!
//! A transport only has to get an envelope into the destination node's [`Inbox`] with its
//! rendezvous signal still attached (or a proxy of it, for transports that cross process
//! boundaries). Matching, sizing and ordering on the receive side are handled by the
//! communicator's mailbox.

pub mod local;
pub mod tcp;

use futures::future::BoxFuture;

use tessera_common::NodeId;

use crate::mailbox::{Envelope, Inbox};

/// Errors returned by individual [`Transport`] implementations.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// No endpoint is known for the destination rank.
    #[error("peer not registered: {0}")]
    PeerNotRegistered(NodeId),

    /// `deliver` was called before `start`.
    #[error("transport not started")]
    NotStarted,

    #[error("transport already started")]
    AlreadyStarted,

    /// The transport, or the destination's inbox, has shut down.
    #[error("transport closed")]
    Closed,

    /// The payload exceeds what the transport can carry in one message.
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("connection to {node} failed: {reason}")]
    Connection { node: NodeId, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Abstraction over a message transport.
///
/// The trait is object-safe so transports can be stored as `Arc<dyn Transport>`.
/// Envelopes delivered to the same destination from the same source must arrive in
/// the order `deliver` was called.
pub trait Transport: Send + Sync {
    /// Short name used in logs (e.g. `"local"`, `"tcp"`).
    fn key(&self) -> &'static str;

    /// Attaches the transport to the local node. Inbound envelopes go to `inbox`.
    fn start(&self, local: NodeId, inbox: Inbox) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Hands an envelope to the transport for delivery to `dest` without blocking.
    ///
    /// Returns once the transport has queued the envelope, not once it was received; the
    /// envelope's rendezvous signal reports the latter. Envelopes must be queued before
    /// this returns.
    fn deliver(&self, dest: NodeId, envelope: Envelope) -> Result<(), TransportError>;

    /// Stops background tasks and fails envelopes still awaiting a rendezvous.
    fn shutdown(&self);
}
