// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reservation transactions against a shared store from many threads.

use std::collections::HashSet;
use std::sync::Arc;

use tessera_common::Tid;
use tessera_storage::{CreateSpec, DENSE, StorageError, TensorMeta, TensorRegistry, TensorStore};

fn create_dense(
    store: &TensorStore,
    registry: &TensorRegistry,
    rows: u32,
    cols: u32,
    fill: f32,
) -> Tid {
    let meta = TensorMeta::new(registry.format_id_for(DENSE).unwrap(), rows, cols);
    let size = registry.tensor_byte_size(&meta).unwrap();
    store
        .local_transaction(&[], &[CreateSpec::new(size)], |txn| {
            let tensor = txn.create(0).unwrap();
            registry.initialize_tensor(tensor.bytes_mut(), &meta)?;
            tensor
                .view_mut()
                .write_f32_values(std::iter::repeat_n(fill, meta.num_elements()))?;
            Ok(tensor.tid())
        })
        .unwrap()
}

#[test]
fn test_concurrent_creates_get_distinct_tids() {
    let store = Arc::new(TensorStore::new());
    let registry = Arc::new(TensorRegistry::with_defaults());

    let tids: Vec<Tid> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let registry = registry.clone();
                scope.spawn(move || {
                    (0..25)
                        .map(|_| create_dense(&store, &registry, 2, 2, i as f32))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    });

    let distinct: HashSet<Tid> = tids.iter().copied().collect();
    assert_eq!(distinct.len(), 200);
    assert_eq!(store.len(), 200);
    assert_eq!(store.reserved_bytes(), 0);
}

#[test]
fn test_failed_create_leaves_tid_space_unchanged() {
    let store = TensorStore::new();
    let registry = TensorRegistry::with_defaults();
    let input = create_dense(&store, &registry, 5, 5, 1.0);
    let before = (store.tids(), store.used_bytes());

    let result = store.local_transaction(&[input, Tid::new(1234)], &[CreateSpec::new(112)], |txn| {
        let Some(_missing) = txn.get(1) else {
            anyhow::bail!("input {} is missing", Tid::new(1234));
        };
        Ok(())
    });

    let error = result.unwrap_err();
    assert!(matches!(error, StorageError::Aborted(_)));
    assert!(error.to_string().contains("is missing"));
    assert_eq!((store.tids(), store.used_bytes()), before);
    assert_eq!(store.reserved_bytes(), 0);
}

#[test]
fn test_reads_see_committed_content() {
    let store = TensorStore::new();
    let registry = TensorRegistry::with_defaults();
    let tid = create_dense(&store, &registry, 1, 3, 2.5);

    let (meta, values) = store
        .local_transaction(&[tid], &[], |txn| {
            let tensor = txn.get(0).unwrap();
            Ok((tensor.meta()?, tensor.f32_values().collect::<Vec<_>>()))
        })
        .unwrap();
    assert_eq!((meta.num_rows, meta.num_cols), (1, 3));
    assert_eq!(values, vec![2.5; 3]);
}
