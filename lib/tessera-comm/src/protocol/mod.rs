// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Protocols layered on the [`Communicator`](crate::Communicator): command dispatch and
//! forwarding, and tensor notifications. Each runs on its own reserved [`Channel`](crate::Channel).

mod dispatch;
mod notify;

pub use notify::Notification;
