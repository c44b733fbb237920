// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use tessera_common::NodeId;

use crate::channel::Channel;
use crate::command::CommandError;
use crate::transport::TransportError;

/// Errors surfaced by [`Communicator`](crate::Communicator) and the protocols built on it.
///
/// Everything except [`CommError::Initialization`] is recoverable: the caller may retry,
/// address other nodes, or abandon the higher-level operation.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    /// The runtime cannot run sends and receives concurrently from independent tasks.
    #[error("communicator initialization failed: {0}")]
    Initialization(String),

    #[error("{node} is outside the group of {group_size} nodes")]
    InvalidNode { node: NodeId, group_size: u32 },

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The receiver dropped the message without consuming it, or the connection died first.
    #[error("message to {node} on channel {channel} was never matched by a receive")]
    Unmatched { node: NodeId, channel: Channel },

    #[error("receive buffer holds {expected} bytes but the message carries {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("communicator closed")]
    Closed,

    #[error("malformed command from {source_node}: {error}")]
    MalformedCommand {
        source_node: NodeId,
        #[source]
        error: CommandError,
    },

    #[error("cannot encode command: {0}")]
    Encode(#[source] CommandError),

    #[error("notification of {0} bytes is not a whole number of tensor ids")]
    MalformedNotification(usize),
}
