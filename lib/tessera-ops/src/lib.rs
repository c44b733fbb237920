// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Kernels and the operators that run them against the local tensor store.
//!
//! A [`Kernel`] knows two things: the metadata of its output given its inputs, and how to
//! compute the output. The executors ([`BinaryReduceOp`], [`ApplyOp`]) run a kernel in
//! two reservation transactions: the first derives the output size from the inputs, the
//! second allocates exactly that much and invokes the kernel.

mod error;
mod executor;
mod kernel;
pub mod kernels;

pub use error::OpError;
pub use executor::{ApplyOp, BinaryReduceOp};
pub use kernel::{Kernel, KernelImpl, KernelLibrary};
