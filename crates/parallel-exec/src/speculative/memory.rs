//! In-process versioned state store.
//!
//! Keeps the full version history of every key so it can serve both latest and
//! as-of reads. Suitable for tests, simulations and short replays; production
//! deployments plug their own [`VersionedStateStore`].

use crate::speculative::{
    state::{HistoryReader, StateReader, StoreError, VersionedStateStore},
    types::{Account, Domain, IndexTable, TxNum, account_key, decode_storage_value, storage_key},
};
use alloy_primitives::{Address, B256, Bytes, Keccak256, U256};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::atomic::{AtomicU64, Ordering},
};

/// Versions of one key as `(stamp, value)`, oldest first. A stamp is the writing sequence
/// number plus one; stamp 0 is genesis. `None` marks a deletion.
type VersionChain = Vec<(u64, Option<Bytes>)>;

/// A sealed checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub step: u64,
    /// Last sequence number included in the checkpoint.
    pub tx_num: TxNum,
    pub root: B256,
}

#[derive(Debug)]
pub struct InMemoryStore {
    step_size: u64,
    stamp: AtomicU64,
    domains: RwLock<[BTreeMap<Vec<u8>, VersionChain>; 3]>,
    indices: DashMap<IndexTable, BTreeMap<Vec<u8>, Vec<TxNum>>>,
    checkpoints: Mutex<Vec<Checkpoint>>,
}

impl InMemoryStore {
    pub fn new(step_size: u64) -> Self {
        Self {
            step_size,
            stamp: AtomicU64::new(0),
            domains: RwLock::new(Default::default()),
            indices: DashMap::new(),
            checkpoints: Mutex::new(Vec::new()),
        }
    }

    /// Seeds a value visible to every sequence number. Call before running the pipeline.
    pub fn insert_genesis(&self, domain: Domain, key: &[u8], value: Bytes) {
        let mut domains = self.domains.write();
        domains[domain.slot()].insert(key.to_vec(), vec![(0, Some(value))]);
    }

    pub fn insert_genesis_account(&self, address: &Address, account: &Account) {
        self.insert_genesis(Domain::Accounts, address.as_slice(), account.encode());
    }

    pub fn account(&self, address: &Address) -> Result<Option<Account>, StoreError> {
        self.get_latest(Domain::Accounts, &account_key(address))?
            .map(|raw| Account::decode(&raw))
            .transpose()
    }

    pub fn storage(&self, address: &Address, slot: &B256) -> Result<U256, StoreError> {
        match self.get_latest(Domain::Storage, &storage_key(address, slot))? {
            Some(raw) => decode_storage_value(&raw),
            None => Ok(U256::ZERO),
        }
    }

    pub fn code(&self, address: &Address) -> Result<Option<Bytes>, StoreError> {
        self.get_latest(Domain::Code, address.as_slice())
    }

    /// Sequence numbers recorded against `key` in `table`, in insertion order.
    pub fn index(&self, table: IndexTable, key: &[u8]) -> Vec<TxNum> {
        self.indices
            .get(&table)
            .and_then(|entries| entries.get(key).cloned())
            .unwrap_or_default()
    }

    /// Number of live keys in `domain`.
    pub fn len(&self, domain: Domain) -> usize {
        self.domains.read()[domain.slot()]
            .values()
            .filter(|chain| matches!(chain.last(), Some((_, Some(_)))))
            .count()
    }

    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.checkpoints.lock().clone()
    }

    fn current_tx_num(&self) -> TxNum {
        self.stamp.load(Ordering::Acquire).saturating_sub(1)
    }

    fn write(&self, domain: Domain, key: &[u8], value: Option<Bytes>) {
        let stamp = self.stamp.load(Ordering::Acquire);
        let mut domains = self.domains.write();
        let map = &mut domains[domain.slot()];
        match map.get_mut(key) {
            Some(chain) => stamp_version(chain, stamp, value),
            None if value.is_some() => {
                map.insert(key.to_vec(), vec![(stamp, value)]);
            }
            None => {}
        }
    }
}

fn stamp_version(chain: &mut VersionChain, stamp: u64, value: Option<Bytes>) {
    match chain.last_mut() {
        Some((last, current)) if *last == stamp => *current = value,
        Some((_, None)) if value.is_none() => {}
        _ => chain.push((stamp, value)),
    }
}

impl StateReader for InMemoryStore {
    fn get_latest(&self, domain: Domain, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        Ok(self.domains.read()[domain.slot()]
            .get(key)
            .and_then(|chain| chain.last())
            .and_then(|(_, value)| value.clone()))
    }
}

impl HistoryReader for InMemoryStore {
    fn get_as_of(
        &self,
        domain: Domain,
        key: &[u8],
        tx_num: TxNum,
    ) -> Result<Option<Bytes>, StoreError> {
        Ok(self.domains.read()[domain.slot()]
            .get(key)
            .and_then(|chain| chain.iter().rev().find(|(stamp, _)| *stamp <= tx_num))
            .and_then(|(_, value)| value.clone()))
    }
}

impl VersionedStateStore for InMemoryStore {
    fn set_tx_num(&self, tx_num: TxNum) {
        self.stamp.store(tx_num + 1, Ordering::Release);
    }

    fn put(&self, domain: Domain, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.write(domain, key, Some(Bytes::copy_from_slice(value)));
        Ok(())
    }

    fn delete(&self, domain: Domain, key: &[u8]) -> Result<(), StoreError> {
        self.write(domain, key, None);
        Ok(())
    }

    fn delete_prefix(&self, domain: Domain, prefix: &[u8]) -> Result<(), StoreError> {
        let stamp = self.stamp.load(Ordering::Acquire);
        let mut domains = self.domains.write();
        domains[domain.slot()]
            .range_mut::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .for_each(|(_, chain)| stamp_version(chain, stamp, None));
        Ok(())
    }

    fn index_add(&self, table: IndexTable, key: &[u8]) -> Result<(), StoreError> {
        let tx_num = self.current_tx_num();
        self.indices
            .entry(table)
            .or_default()
            .entry(key.to_vec())
            .or_default()
            .push(tx_num);
        Ok(())
    }

    fn step_size(&self) -> u64 {
        self.step_size
    }

    fn compute_checkpoint(&self, step: u64) -> Result<B256, StoreError> {
        let mut hasher = Keccak256::new();
        {
            let domains = self.domains.read();
            for (domain, map) in Domain::ALL.iter().zip(domains.iter()) {
                for (key, chain) in map {
                    if let Some((_, Some(value))) = chain.last() {
                        hasher.update([domain.slot() as u8]);
                        hasher.update((key.len() as u32).to_be_bytes());
                        hasher.update(key);
                        hasher.update((value.len() as u32).to_be_bytes());
                        hasher.update(value);
                    }
                }
            }
        }
        let root = hasher.finalize();
        self.checkpoints.lock().push(Checkpoint {
            step,
            tx_num: self.current_tx_num(),
            root,
        });
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(value: &[u8]) -> Bytes {
        Bytes::copy_from_slice(value)
    }

    #[test]
    fn test_latest_and_as_of_reads() {
        let store = InMemoryStore::new(4);
        store.insert_genesis(Domain::Code, b"k", bytes(b"genesis"));

        store.set_tx_num(3);
        store.put(Domain::Code, b"k", b"three").unwrap();
        store.set_tx_num(7);
        store.delete(Domain::Code, b"k").unwrap();

        assert_eq!(store.get_latest(Domain::Code, b"k").unwrap(), None);
        assert_eq!(store.get_as_of(Domain::Code, b"k", 0).unwrap(), Some(bytes(b"genesis")));
        assert_eq!(store.get_as_of(Domain::Code, b"k", 3).unwrap(), Some(bytes(b"genesis")));
        assert_eq!(store.get_as_of(Domain::Code, b"k", 4).unwrap(), Some(bytes(b"three")));
        assert_eq!(store.get_as_of(Domain::Code, b"k", 8).unwrap(), None);
    }

    #[test]
    fn test_same_sequence_overwrites() {
        let store = InMemoryStore::new(4);
        store.set_tx_num(1);
        store.put(Domain::Storage, b"slot", b"a").unwrap();
        store.put(Domain::Storage, b"slot", b"b").unwrap();

        assert_eq!(store.get_latest(Domain::Storage, b"slot").unwrap(), Some(bytes(b"b")));
        assert_eq!(store.get_as_of(Domain::Storage, b"slot", 1).unwrap(), None);
        assert_eq!(store.len(Domain::Storage), 1);
    }

    #[test]
    fn test_delete_prefix_only_touches_prefix() {
        let store = InMemoryStore::new(4);
        store.set_tx_num(0);
        store.put(Domain::Storage, b"aa1", b"1").unwrap();
        store.put(Domain::Storage, b"aa2", b"2").unwrap();
        store.put(Domain::Storage, b"ab1", b"3").unwrap();

        store.set_tx_num(1);
        store.delete_prefix(Domain::Storage, b"aa").unwrap();

        assert_eq!(store.len(Domain::Storage), 1);
        assert_eq!(store.get_latest(Domain::Storage, b"ab1").unwrap(), Some(bytes(b"3")));
        assert_eq!(store.get_as_of(Domain::Storage, b"aa1", 1).unwrap(), Some(bytes(b"1")));
    }

    #[test]
    fn test_index_records_sequence() {
        let store = InMemoryStore::new(4);
        store.set_tx_num(2);
        store.index_add(IndexTable::LogAddress, b"addr").unwrap();
        store.set_tx_num(5);
        store.index_add(IndexTable::LogAddress, b"addr").unwrap();

        assert_eq!(store.index(IndexTable::LogAddress, b"addr"), vec![2, 5]);
        assert!(store.index(IndexTable::TracesTo, b"addr").is_empty());
    }

    #[test]
    fn test_checkpoint_root_tracks_state() {
        let store = InMemoryStore::new(4);
        store.set_tx_num(3);
        let empty = store.compute_checkpoint(0).unwrap();

        store.put(Domain::Accounts, b"acc", b"v1").unwrap();
        let first = store.compute_checkpoint(1).unwrap();
        assert_ne!(empty, first);

        store.delete(Domain::Accounts, b"acc").unwrap();
        let cleared = store.compute_checkpoint(2).unwrap();
        assert_eq!(empty, cleared);

        let steps: Vec<u64> = store.checkpoints().iter().map(|c| c.step).collect();
        assert_eq!(steps, vec![0, 1, 2]);
        assert!(store.checkpoints().iter().all(|c| c.tx_num == 3));
    }
}
