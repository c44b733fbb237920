// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Identifiers and parameter values shared by every tessera crate.
//!
//! A [`NodeId`] names a process in the static group, a [`Tid`] names a tensor inside one
//! node's local store, and a [`Param`] is one scalar argument carried by a command and
//! handed to a kernel.

mod ids;
mod param;

pub use ids::{NodeId, Tid};
pub use param::{Param, ParamError};
