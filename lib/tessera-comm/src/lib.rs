// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Inter-node communication substrate for tessera.
//!
//! A [`Communicator`] joins a fixed group of ranks over a [`Transport`] and offers tagged
//! point-to-point messaging with rendezvous semantics: a send completes only once the
//! destination has consumed the message. Messages whose size is not known up front are
//! received in two steps, [`Communicator::probe`] then [`Communicator::receive`].
//!
//! On top of that sit two protocols, each on its own reserved [`Channel`]:
//!
//! - **Command dispatch**: a [`Command`] is sent to every node owning one of its inputs or
//!   outputs, either by its originator ([`Communicator::dispatch`]) or relayed by a
//!   participant ([`Communicator::forward`]).
//! - **Tensor notifications**: a node announces freshly committed tensor ids to another
//!   ([`Communicator::notify_created`]).
//!
//! # Transports
//!
//! - [`LocalFabric`]: every rank in one process, used by tests and single-process runs.
//! - [`TcpTransport`]: one listener per rank plus a lazily connected writer per peer.

pub mod channel;
pub mod command;
mod communicator;
mod error;
mod mailbox;
pub mod protocol;
pub mod transport;

pub use channel::{Channel, USER_TAG_BASE};
pub use command::{Command, CommandError, CommandId, CommandKind, TensorLocation};
pub use communicator::{AsyncRequest, Communicator, Receipt};
pub use error::CommError;
pub use mailbox::{Envelope, Inbox, Peer};
pub use protocol::Notification;
pub use transport::local::LocalFabric;
pub use transport::tcp::{TcpOptions, TcpTransport, TcpTransportBuilder, parse_tcp_endpoint};
pub use transport::{Transport, TransportError};

pub use tessera_common::{NodeId, Param, Tid};
