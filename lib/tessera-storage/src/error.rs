// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use tessera_common::Tid;

use crate::meta::{FormatId, TensorMeta};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The transaction callback failed; nothing it created was committed.
    #[error("transaction aborted: {0:#}")]
    Aborted(#[source] anyhow::Error),

    #[error("{0} is already committed or reserved")]
    TidInUse(Tid),

    #[error("{0} cannot name a tensor")]
    InvalidTid(Tid),

    #[error("no tensor ids left to assign")]
    TidsExhausted,

    #[error("{0} not found")]
    NotFound(Tid),

    #[error("reserving {requested} bytes exceeds capacity ({available} available)")]
    CapacityExceeded { requested: usize, available: usize },

    #[error("unknown tensor format {0}")]
    UnknownFormat(FormatId),

    #[error("unknown tensor type {0:?}")]
    UnknownType(String),

    #[error("tensor type {0:?} is already registered")]
    DuplicateType(String),

    #[error("tensor of {0} bytes is too small for its metadata header")]
    TruncatedHeader(usize),

    #[error("tensor {0} does not fit in memory")]
    TooLarge(TensorMeta),

    #[error("creates totalling more than {} bytes cannot be reserved", usize::MAX)]
    RequestTooLarge,

    #[error("tensor buffer holds {actual} bytes but its metadata needs {expected}")]
    BufferSize { expected: usize, actual: usize },
}
