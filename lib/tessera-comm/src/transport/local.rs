// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process transport: every node of the group lives in the same process and envelopes
//! are pushed straight into the destination's inbox.

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use tracing::debug;

use tessera_common::NodeId;

use super::{Transport, TransportError};
use crate::communicator::Communicator;
use crate::error::CommError;
use crate::mailbox::{Envelope, Inbox};

/// Shared registry of the inboxes of an in-process group.
#[derive(Default)]
pub struct LocalFabric {
    inboxes: DashMap<NodeId, Inbox>,
}

impl LocalFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport attached to this fabric, for one node.
    pub fn transport(self: &Arc<Self>) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            fabric: self.clone(),
        })
    }

    /// Builds a complete group of `group_size` communicators sharing one fabric.
    pub async fn group(group_size: u32) -> Result<Vec<Communicator>, CommError> {
        let fabric = Self::new();
        let mut group = Vec::with_capacity(group_size as usize);
        for rank in 0..group_size {
            let communicator =
                Communicator::new(NodeId::new(rank), group_size, fabric.transport()).await?;
            group.push(communicator);
        }
        Ok(group)
    }

    pub fn len(&self) -> usize {
        self.inboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inboxes.is_empty()
    }
}

struct LocalTransport {
    fabric: Arc<LocalFabric>,
}

impl Transport for LocalTransport {
    fn key(&self) -> &'static str {
        "local"
    }

    fn start(&self, local: NodeId, inbox: Inbox) -> BoxFuture<'_, Result<(), TransportError>> {
        self.fabric.inboxes.insert(local, inbox);
        debug!("Attached {} to local fabric", local);
        futures::future::ready(Ok(())).boxed()
    }

    fn deliver(&self, dest: NodeId, envelope: Envelope) -> Result<(), TransportError> {
        let inbox = self
            .fabric
            .inboxes
            .get(&dest)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::PeerNotRegistered(dest))?;
        inbox.push(envelope).map_err(|_| TransportError::Closed)
    }

    fn shutdown(&self) {
        self.fabric.inboxes.retain(|_, inbox| !inbox.is_closed());
    }
}
