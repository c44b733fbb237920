// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use tessera_common::Tid;
use tessera_storage::StorageError;

/// Why an operator produced no output.
#[derive(Debug, thiserror::Error)]
pub enum OpError {
    #[error("no kernel with id {0}")]
    UnknownKernel(u32),

    #[error("no kernel named {0:?}")]
    UnknownKernelName(String),

    #[error("kernel {0:?} is already registered")]
    DuplicateKernel(String),

    #[error("kernel {kernel} takes {expected} input(s), got {actual}")]
    Arity {
        kernel: String,
        expected: usize,
        actual: usize,
    },

    #[error("input {0} is not in the local store")]
    MissingInput(Tid),

    /// The inputs no longer yield the metadata computed in the first phase.
    #[error("inputs changed between metadata and execution phases")]
    InputsChanged,

    #[error("kernel {kernel} failed: {source:#}")]
    Kernel {
        kernel: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Storage(StorageError),
}

impl From<StorageError> for OpError {
    /// Recovers an `OpError` raised inside a transaction callback.
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::Aborted(inner) => match inner.downcast::<OpError>() {
                Ok(op_error) => op_error,
                Err(inner) => OpError::Storage(StorageError::Aborted(inner)),
            },
            other => OpError::Storage(other),
        }
    }
}
