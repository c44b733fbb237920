// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Node-local tensor storage.
//!
//! All access to the store goes through [`TensorStore::local_transaction`], which pins the
//! tensors it reads and reserves the ones it creates for the duration of one callback.
//! Creates become visible only if the callback succeeds.
//!
//! Tensors are self-describing byte blocks: a [`TensorMeta`] header followed by a
//! format-specific payload. The [`TensorRegistry`] maps format names to ids and knows how
//! large a tensor of given metadata is and how to initialize one.

mod error;
mod meta;
mod registry;
mod store;
mod tensor;

pub use error::StorageError;
pub use meta::{FormatId, META_SIZE, TensorMeta};
pub use registry::{DENSE, DenseFormat, TensorFormat, TensorRegistry};
pub use store::{CreateSpec, PendingTensor, ReadSet, Reservation, TensorStore};
pub use tensor::{TensorMut, TensorRef};
