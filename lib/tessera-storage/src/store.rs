// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The node-local tensor store and its reservation transactions.
//!
//! A transaction takes one short lock to pin its reads and reserve its creates, runs the
//! callback without holding any lock, and takes the lock once more to publish the creates.
//! Committed blocks are immutable and shared through `Arc`, so a reader keeps the bytes it
//! pinned even if the tensor is removed while its callback runs; later transactions no
//! longer see it. Reserved ids and bytes are released by a guard, so a failing or
//! panicking callback leaves the store as it found it.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use tessera_common::Tid;

use crate::error::StorageError;
use crate::tensor::{TensorMut, TensorRef};

/// A tensor to create inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateSpec {
    /// Requested id; `None` assigns the next free one.
    pub tid: Option<Tid>,
    pub num_bytes: usize,
}

impl CreateSpec {
    pub const fn new(num_bytes: usize) -> Self {
        Self {
            tid: None,
            num_bytes,
        }
    }

    pub const fn with_tid(tid: Tid, num_bytes: usize) -> Self {
        Self {
            tid: Some(tid),
            num_bytes,
        }
    }
}

/// Tensors pinned by a transaction, in the order they were requested.
#[derive(Debug)]
pub struct ReadSet {
    entries: Vec<(Tid, Option<Arc<[u8]>>)>,
}

impl ReadSet {
    /// The tensor at `index`, or `None` if the store did not hold it.
    pub fn get(&self, index: usize) -> Option<TensorRef<'_>> {
        let (tid, block) = self.entries.get(index)?;
        block.as_deref().map(|bytes| TensorRef::new(*tid, bytes))
    }

    pub fn tid(&self, index: usize) -> Option<Tid> {
        self.entries.get(index).map(|(tid, _)| *tid)
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<TensorRef<'_>>> + '_ {
        (0..self.entries.len()).map(|index| self.get(index))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A zeroed block the callback must initialize.
#[derive(Debug)]
pub struct PendingTensor {
    tid: Tid,
    data: Box<[u8]>,
}

impl PendingTensor {
    /// Id the tensor will be committed under.
    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn num_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn view_mut(&mut self) -> TensorMut<'_> {
        TensorMut::new(self.tid, &mut self.data)
    }
}

/// What a transaction callback works with.
#[derive(Debug)]
pub struct Reservation {
    reads: ReadSet,
    creates: Vec<PendingTensor>,
}

impl Reservation {
    pub fn get(&self, index: usize) -> Option<TensorRef<'_>> {
        self.reads.get(index)
    }

    pub fn reads(&self) -> &ReadSet {
        &self.reads
    }

    pub fn create(&mut self, index: usize) -> Option<&mut PendingTensor> {
        self.creates.get_mut(index)
    }

    pub fn created_tid(&self, index: usize) -> Option<Tid> {
        self.creates.get(index).map(PendingTensor::tid)
    }

    /// Reads and creates at once, for kernels that write while reading.
    pub fn split(&mut self) -> (&ReadSet, &mut [PendingTensor]) {
        (&self.reads, &mut self.creates)
    }
}

#[derive(Default)]
struct StoreState {
    tensors: HashMap<Tid, Arc<[u8]>>,
    reserved: HashSet<Tid>,
    next_tid: i32,
    used_bytes: usize,
    reserved_bytes: usize,
}

impl StoreState {
    fn is_taken(&self, tid: Tid) -> bool {
        self.tensors.contains_key(&tid) || self.reserved.contains(&tid)
    }

    fn next_free_tid(&mut self) -> Result<Tid, StorageError> {
        loop {
            let candidate = Tid::new(self.next_tid);
            self.next_tid = self
                .next_tid
                .checked_add(1)
                .ok_or(StorageError::TidsExhausted)?;
            if !self.is_taken(candidate) {
                return Ok(candidate);
            }
        }
    }

    /// Reserves an id per spec, all or nothing.
    fn reserve(&mut self, specs: &[CreateSpec]) -> Result<Vec<Tid>, StorageError> {
        let next_tid = self.next_tid;
        let mut tids = Vec::with_capacity(specs.len());
        for spec in specs {
            let tid = match spec.tid {
                Some(tid) if tid.as_i32() < 0 => Err(StorageError::InvalidTid(tid)),
                Some(tid) if self.is_taken(tid) => Err(StorageError::TidInUse(tid)),
                Some(tid) => Ok(tid),
                None => self.next_free_tid(),
            };
            match tid {
                Ok(tid) => {
                    self.reserved.insert(tid);
                    tids.push(tid);
                }
                Err(e) => {
                    for tid in &tids {
                        self.reserved.remove(tid);
                    }
                    self.next_tid = next_tid;
                    return Err(e);
                }
            }
        }
        Ok(tids)
    }
}

/// Releases the ids and bytes of a transaction unless it committed.
///
/// Assigned ids are given back by rewinding the counter from `tid_counter.1` to
/// `tid_counter.0`, which only happens if no later reservation has moved it since.
struct ReservationGuard<'a> {
    store: &'a TensorStore,
    tids: Vec<Tid>,
    num_bytes: usize,
    tid_counter: (i32, i32),
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        if self.tids.is_empty() && self.num_bytes == 0 {
            return;
        }
        let mut state = self.store.state.lock();
        for tid in &self.tids {
            state.reserved.remove(tid);
        }
        state.reserved_bytes -= self.num_bytes;
        let (before, after) = self.tid_counter;
        if state.next_tid == after {
            state.next_tid = before;
        }
        debug!(
            "Released {} reserved tensor(s), {} bytes",
            self.tids.len(),
            self.num_bytes
        );
    }
}

/// A node's tensors, keyed by [`Tid`].
#[derive(Default)]
pub struct TensorStore {
    state: Mutex<StoreState>,
    capacity: Option<usize>,
}

impl TensorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that refuses reservations beyond `capacity` bytes in total.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::default(),
            capacity: Some(capacity),
        }
    }

    /// Runs `callback` over a pinned read set and freshly reserved creates.
    ///
    /// Slot `i` of the read set holds `get_tids[i]`, or nothing if the store does not have
    /// it. Slot `i` of the creates is a zeroed block of `create_specs[i].num_bytes` bytes.
    /// The creates are committed only if `callback` returns `Ok`; otherwise the error is
    /// returned as [`StorageError::Aborted`] and the store is unchanged.
    pub fn local_transaction<R>(
        &self,
        get_tids: &[Tid],
        create_specs: &[CreateSpec],
        callback: impl FnOnce(&mut Reservation) -> anyhow::Result<R>,
    ) -> Result<R, StorageError> {
        let (mut guard, reads) = self.begin(get_tids, create_specs)?;

        let creates = guard
            .tids
            .iter()
            .zip(create_specs)
            .map(|(tid, spec)| PendingTensor {
                tid: *tid,
                data: vec![0u8; spec.num_bytes].into_boxed_slice(),
            })
            .collect();
        let mut reservation = Reservation { reads, creates };

        match callback(&mut reservation) {
            Ok(value) => {
                self.commit(&mut guard, reservation.creates);
                Ok(value)
            }
            Err(error) => {
                debug!("Transaction aborted: {:#}", error);
                Err(StorageError::Aborted(error))
            }
        }
    }

    fn begin(
        &self,
        get_tids: &[Tid],
        create_specs: &[CreateSpec],
    ) -> Result<(ReservationGuard<'_>, ReadSet), StorageError> {
        let requested = create_specs
            .iter()
            .try_fold(0usize, |total, spec| total.checked_add(spec.num_bytes))
            .ok_or(StorageError::RequestTooLarge)?;

        let mut state = self.state.lock();
        if let Some(capacity) = self.capacity {
            let in_use = state.used_bytes.saturating_add(state.reserved_bytes);
            let available = capacity.saturating_sub(in_use);
            if requested > available {
                return Err(StorageError::CapacityExceeded {
                    requested,
                    available,
                });
            }
        }

        let reserved_bytes = state
            .reserved_bytes
            .checked_add(requested)
            .ok_or(StorageError::RequestTooLarge)?;
        let counter_before = state.next_tid;
        let tids = state.reserve(create_specs)?;
        let tid_counter = (counter_before, state.next_tid);
        state.reserved_bytes = reserved_bytes;

        let entries = get_tids
            .iter()
            .map(|tid| (*tid, state.tensors.get(tid).cloned()))
            .collect();
        drop(state);

        Ok((
            ReservationGuard {
                store: self,
                tids,
                num_bytes: requested,
                tid_counter,
            },
            ReadSet { entries },
        ))
    }

    fn commit(&self, guard: &mut ReservationGuard<'_>, created: Vec<PendingTensor>) {
        let mut state = self.state.lock();
        for tensor in created {
            state.reserved.remove(&tensor.tid);
            state.used_bytes += tensor.data.len();
            debug!("Committed {} ({} bytes)", tensor.tid, tensor.data.len());
            state.tensors.insert(tensor.tid, Arc::from(tensor.data));
        }
        state.reserved_bytes -= guard.num_bytes;

        guard.tids.clear();
        guard.num_bytes = 0;
    }

    /// Deletes a committed tensor. Transactions already reading it are unaffected.
    pub fn remove(&self, tid: Tid) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        let block = state
            .tensors
            .remove(&tid)
            .ok_or(StorageError::NotFound(tid))?;
        state.used_bytes -= block.len();
        debug!("Removed {} ({} bytes)", tid, block.len());
        Ok(())
    }

    pub fn contains(&self, tid: Tid) -> bool {
        self.state.lock().tensors.contains_key(&tid)
    }

    pub fn len(&self) -> usize {
        self.state.lock().tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().tensors.is_empty()
    }

    /// Committed ids, ascending.
    pub fn tids(&self) -> Vec<Tid> {
        let mut tids: Vec<Tid> = self.state.lock().tensors.keys().copied().collect();
        tids.sort_unstable();
        tids
    }

    pub fn used_bytes(&self) -> usize {
        self.state.lock().used_bytes
    }

    pub fn reserved_bytes(&self) -> usize {
        self.state.lock().reserved_bytes
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

impl std::fmt::Debug for TensorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TensorStore")
            .field("tensors", &state.tensors.len())
            .field("used_bytes", &state.used_bytes)
            .field("reserved_bytes", &state.reserved_bytes)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn put(store: &TensorStore, bytes: &[u8]) -> Tid {
        store
            .local_transaction(&[], &[CreateSpec::new(bytes.len())], |txn| {
                let tensor = txn.create(0).unwrap();
                tensor.bytes_mut().copy_from_slice(bytes);
                Ok(tensor.tid())
            })
            .unwrap()
    }

    #[test]
    fn test_create_commits_on_success() {
        let store = TensorStore::new();
        let tid = put(&store, b"abcd");
        assert!(store.contains(tid));
        assert_eq!(store.used_bytes(), 4);
        assert_eq!(store.reserved_bytes(), 0);

        let read = store
            .local_transaction(&[tid], &[], |txn| Ok(txn.get(0).unwrap().bytes().to_vec()))
            .unwrap();
        assert_eq!(read, b"abcd");
    }

    #[test]
    fn test_failed_callback_leaves_store_unchanged() {
        let store = TensorStore::new();
        let existing = put(&store, b"x");
        let before = store.tids();

        let result: Result<(), _> =
            store.local_transaction(&[existing], &[CreateSpec::new(64)], |txn| {
                txn.create(0).unwrap().bytes_mut().fill(1);
                anyhow::bail!("kernel failed")
            });
        assert!(matches!(result, Err(StorageError::Aborted(_))));
        assert_eq!(store.tids(), before);
        assert_eq!(store.used_bytes(), 1);
        assert_eq!(store.reserved_bytes(), 0);

        // the id that was reserved is handed out again
        let next = put(&store, b"y");
        assert_eq!(next, Tid::new(existing.as_i32() + 1));
    }

    #[test]
    fn test_panicking_callback_releases_reservation() {
        let store = TensorStore::with_capacity(16);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = store.local_transaction(
                &[],
                &[CreateSpec::new(16)],
                |_| -> anyhow::Result<()> { panic!("boom") },
            );
        }));
        assert!(result.is_err());
        assert_eq!(store.reserved_bytes(), 0);
        assert!(store.is_empty());
        put(&store, &[0u8; 16]);
    }

    #[test]
    fn test_abort_keeps_ids_taken_by_a_later_reservation() {
        let store = TensorStore::new();
        let result: Result<(), _> = store.local_transaction(&[], &[CreateSpec::new(1)], |outer| {
            let outer_tid = outer.created_tid(0).unwrap();
            let inner_tid = put(&store, b"i");
            assert_eq!(inner_tid, Tid::new(outer_tid.as_i32() + 1));
            anyhow::bail!("outer failed")
        });
        assert!(result.is_err());

        // the counter moved past the aborted id, so it is not rewound
        let next = put(&store, b"n");
        assert_eq!(next, Tid::new(2));
        assert_eq!(store.tids(), vec![Tid::new(1), Tid::new(2)]);
    }

    #[test]
    fn test_nested_aborts_return_all_ids() {
        let store = TensorStore::new();
        let result: Result<(), _> = store.local_transaction(&[], &[CreateSpec::new(1)], |_| {
            let inner: Result<(), _> =
                store.local_transaction(&[], &[CreateSpec::new(1), CreateSpec::new(1)], |_| {
                    anyhow::bail!("inner failed")
                });
            assert!(inner.is_err());
            anyhow::bail!("outer failed")
        });
        assert!(result.is_err());
        assert_eq!(put(&store, b"a"), Tid::new(0));
    }

    #[test]
    fn test_oversized_request_is_refused() {
        let store = TensorStore::new();
        let result = store.local_transaction(
            &[],
            &[CreateSpec::new(usize::MAX), CreateSpec::new(1)],
            |_| Ok(()),
        );
        assert!(matches!(result, Err(StorageError::RequestTooLarge)));
        assert_eq!(store.reserved_bytes(), 0);
        assert_eq!(put(&store, b"a"), Tid::new(0));
    }

    #[test]
    fn test_absent_get_is_an_empty_slot() {
        let store = TensorStore::new();
        let present = put(&store, b"here");
        let seen = store
            .local_transaction(&[Tid::new(99), present, Tid::NONE], &[], |txn| {
                Ok(txn
                    .reads()
                    .iter()
                    .map(|slot| slot.map(|tensor| tensor.num_bytes()))
                    .collect::<Vec<_>>())
            })
            .unwrap();
        assert_eq!(seen, vec![None, Some(4), None]);
    }

    #[rstest]
    #[case::negative(Tid::new(-5))]
    #[case::sentinel(Tid::NONE)]
    fn test_invalid_requested_tid(#[case] tid: Tid) {
        let store = TensorStore::new();
        let result = store.local_transaction(&[], &[CreateSpec::with_tid(tid, 4)], |_| Ok(()));
        assert!(matches!(result, Err(StorageError::InvalidTid(_))));
    }

    #[test]
    fn test_requested_tid() {
        let store = TensorStore::new();
        let tid = Tid::new(41);
        store
            .local_transaction(&[], &[CreateSpec::with_tid(tid, 2)], |txn| {
                assert_eq!(txn.created_tid(0), Some(tid));
                Ok(())
            })
            .unwrap();
        assert!(store.contains(tid));

        let again = store.local_transaction(&[], &[CreateSpec::with_tid(tid, 2)], |_| Ok(()));
        assert!(matches!(again, Err(StorageError::TidInUse(t)) if t == tid));
    }

    #[test]
    fn test_reservation_is_all_or_nothing() {
        let store = TensorStore::new();
        let taken = put(&store, b"t");
        let result = store.local_transaction(
            &[],
            &[CreateSpec::new(8), CreateSpec::with_tid(taken, 8)],
            |_| Ok(()),
        );
        assert!(matches!(result, Err(StorageError::TidInUse(_))));
        assert_eq!(store.reserved_bytes(), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_reserved_tid_is_not_reused_by_concurrent_transaction() {
        let store = TensorStore::new();
        store
            .local_transaction(&[], &[CreateSpec::new(1)], |outer| {
                let outer_tid = outer.created_tid(0).unwrap();
                let inner_tid = store
                    .local_transaction(&[], &[CreateSpec::new(1)], |inner| {
                        Ok(inner.created_tid(0).unwrap())
                    })
                    .unwrap();
                assert_ne!(outer_tid, inner_tid);
                // the outer create is not visible yet
                assert!(!store.contains(outer_tid));
                assert_eq!(store.reserved_bytes(), 1);
                Ok(())
            })
            .unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_capacity_limit() {
        let store = TensorStore::with_capacity(10);
        put(&store, &[0u8; 6]);
        let result = store.local_transaction(&[], &[CreateSpec::new(5)], |_| Ok(()));
        assert!(matches!(
            result,
            Err(StorageError::CapacityExceeded {
                requested: 5,
                available: 4
            })
        ));
        put(&store, &[0u8; 4]);
        assert_eq!(store.used_bytes(), 10);
    }

    #[test]
    fn test_remove_while_pinned() {
        let store = TensorStore::new();
        let tid = put(&store, b"pinned");
        let bytes = store
            .local_transaction(&[tid], &[], |txn| {
                store.remove(tid)?;
                // the pinned block stays readable until the callback returns
                Ok(txn.get(0).unwrap().bytes().to_vec())
            })
            .unwrap();
        assert_eq!(bytes, b"pinned");
        assert!(!store.contains(tid));
        assert_eq!(store.used_bytes(), 0);
        assert!(matches!(store.remove(tid), Err(StorageError::NotFound(_))));
    }
}
