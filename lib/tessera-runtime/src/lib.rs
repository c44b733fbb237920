// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Node runtime for tessera.
//!
//! Ties the communicator, the local tensor store and the kernel library together into a
//! [`Node`] that serves dispatched commands and tensor notifications, plus the process-wide
//! [`config`] and [`logging`] setup.

pub mod config;
pub mod logging;
mod node;

pub use config::{ConfigError, TesseraConfig};
pub use node::{Node, NodeServices, RemoteTensorIndex};
