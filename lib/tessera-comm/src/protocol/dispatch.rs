// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Command dispatch and forwarding.
//!
//! Both deliver a [`Command`] to every node it references except the local one; they only
//! differ in channel. A receive loop listening on [`Channel::Dispatch`] sees work sent by
//! its originator, one on [`Channel::Forward`] sees work relayed by a participant.

use tracing::debug;

use crate::channel::Channel;
use crate::command::Command;
use crate::communicator::{AsyncRequest, Communicator, wait_all};
use crate::error::CommError;
use crate::mailbox::Peer;

impl Communicator {
    /// Sends `command` to every other node it references on the dispatch channel.
    ///
    /// Succeeds once every one of those nodes has received it. A command that only
    /// references the local node sends nothing.
    pub async fn dispatch(&self, command: &Command) -> Result<(), CommError> {
        self.broadcast_command(command, Channel::Dispatch).await
    }

    /// Relays a command this node already holds to the other nodes it references.
    pub async fn forward(&self, command: &Command) -> Result<(), CommError> {
        self.broadcast_command(command, Channel::Forward).await
    }

    /// Waits for the next command dispatched to this node by any node.
    pub async fn receive_dispatch(&self) -> Result<Command, CommError> {
        self.receive_command(Channel::Dispatch).await
    }

    /// Waits for the next command forwarded to this node by any node.
    pub async fn receive_forward(&self) -> Result<Command, CommError> {
        self.receive_command(Channel::Forward).await
    }

    /// Sends a shutdown command to this node's own dispatch channel, waking its receive
    /// loop. Completes once the loop has received it.
    pub async fn dispatch_shutdown(&self) -> Result<(), CommError> {
        self.send_shutdown(Channel::Dispatch).await
    }

    /// [`dispatch_shutdown`](Self::dispatch_shutdown) for the forward channel.
    pub async fn forward_shutdown(&self) -> Result<(), CommError> {
        self.send_shutdown(Channel::Forward).await
    }

    async fn broadcast_command(
        &self,
        command: &Command,
        channel: Channel,
    ) -> Result<(), CommError> {
        let blob = command.encode().map_err(CommError::Encode)?;

        let requests: Vec<AsyncRequest> = command
            .nodes()
            .into_iter()
            .filter(|node| *node != self.rank())
            .map(|node| self.send_async(blob.clone(), node, channel))
            .collect();

        debug!(
            "{} {} on {} to {} node(s)",
            self.rank(),
            command.id,
            channel,
            requests.len()
        );

        wait_all(requests).await
    }

    async fn receive_command(&self, channel: Channel) -> Result<Command, CommError> {
        let receipt = self.probe(Peer::Any, channel).await?;
        let source_node = receipt.source();
        let blob = self.receive_bytes(receipt);

        let command = Command::decode(blob)
            .map_err(|error| CommError::MalformedCommand { source_node, error })?;
        debug!(
            "{} received {} ({:?}) from {} on {}",
            self.rank(),
            command.id,
            command.kind,
            source_node,
            channel
        );
        Ok(command)
    }

    async fn send_shutdown(&self, channel: Channel) -> Result<(), CommError> {
        let blob = Command::shutdown(self.rank())
            .encode()
            .map_err(CommError::Encode)?;
        self.send_sync(blob, self.rank(), channel).await
    }
}
