//! State adapters between the pipeline and the versioned store.
//!
//! The physical store is external; the pipeline only needs three narrow capabilities:
//!
//! 1. [`StateReader`]: latest committed values, used by live views and the consumer
//! 2. [`HistoryReader`]: values as they were before a given sequence number
//! 3. [`VersionedStateStore`]: mutation, indexing and checkpointing, used by the reducer only
//!
//! Payload executors never see the store directly. They get a [`StateView`]:
//! [`LiveView`] records reads and buffers writes for one task, [`HistoryView`] serves
//! finalized history and is reused by one worker across many tasks.

use crate::speculative::types::{
    Account, Domain, IndexTable, ReadSet, StateRead, TxNum, WriteOp, WriteSet, account_key,
    decode_storage_value, encode_storage_value, storage_key,
};
use alloy_primitives::{Address, B256, Bytes, U256};
use std::collections::BTreeMap;

/// Error type for state store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("invalid account encoding: expected {expected} bytes, got {got}")]
    InvalidAccount { expected: usize, got: usize },
    #[error("invalid storage value of {len} bytes")]
    InvalidStorageValue { len: usize },
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Read access to the latest committed state. Must be safe for concurrent reads while
/// the reducer mutates the store.
pub trait StateReader: Send + Sync {
    fn get_latest(&self, domain: Domain, key: &[u8]) -> Result<Option<Bytes>, StoreError>;
}

pub trait HistoryReader: Send + Sync {
    /// Value visible to the task with sequence `tx_num`: the last write made by any
    /// strictly earlier sequence number.
    fn get_as_of(
        &self,
        domain: Domain,
        key: &[u8],
        tx_num: TxNum,
    ) -> Result<Option<Bytes>, StoreError>;
}

/// The canonical store. Only the reducer calls the mutating methods.
pub trait VersionedStateStore: StateReader + HistoryReader {
    /// Sequence number subsequent writes and index entries are attributed to.
    fn set_tx_num(&self, tx_num: TxNum);

    fn put(&self, domain: Domain, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, domain: Domain, key: &[u8]) -> Result<(), StoreError>;

    fn delete_prefix(&self, domain: Domain, prefix: &[u8]) -> Result<(), StoreError>;

    fn index_add(&self, table: IndexTable, key: &[u8]) -> Result<(), StoreError>;

    /// Number of committed sequence numbers per checkpoint step.
    fn step_size(&self) -> u64;

    /// Seals the state as of the current sequence number, returning its commitment.
    fn compute_checkpoint(&self, step: u64) -> Result<B256, StoreError>;

    /// Whether every recorded read still matches the latest committed value.
    fn reads_valid(&self, reads: &[StateRead]) -> Result<bool, StoreError> {
        for read in reads {
            if self.get_latest(read.domain, &read.key)? != read.value {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// State access handed to a payload executor for one task.
pub trait StateView {
    /// Sequence number of the task being executed.
    fn tx_num(&self) -> TxNum;

    fn get(&mut self, domain: Domain, key: &[u8]) -> Result<Option<Bytes>, StoreError>;

    fn stage(&mut self, domain: Domain, key: Bytes, op: WriteOp);

    /// Credits `amount` to `address` at commit time without reading the balance now.
    fn increase_balance(&mut self, address: Address, amount: U256);

    fn read_account(&mut self, address: &Address) -> Result<Option<Account>, StoreError> {
        self.get(Domain::Accounts, address.as_slice())?
            .map(|raw| Account::decode(&raw))
            .transpose()
    }

    fn read_storage(&mut self, address: &Address, slot: &B256) -> Result<U256, StoreError> {
        match self.get(Domain::Storage, &storage_key(address, slot))? {
            Some(raw) => decode_storage_value(&raw),
            None => Ok(U256::ZERO),
        }
    }

    fn read_code(&mut self, address: &Address) -> Result<Option<Bytes>, StoreError> {
        self.get(Domain::Code, address.as_slice())
    }

    /// Stages an account update. When the original incarnation is newer than the
    /// updated one, the previous code and storage are cleared first.
    fn update_account(&mut self, address: &Address, original: Option<&Account>, account: &Account) {
        if original.is_some_and(|original| original.incarnation > account.incarnation) {
            self.stage(Domain::Code, account_key(address), WriteOp::Delete);
            self.stage(Domain::Storage, account_key(address), WriteOp::DeletePrefix);
        }
        self.stage(Domain::Accounts, account_key(address), WriteOp::Put(account.encode()));
    }

    fn update_code(&mut self, address: &Address, code: Bytes) {
        self.stage(Domain::Code, account_key(address), WriteOp::Put(code));
    }

    fn delete_account(&mut self, address: &Address) {
        self.stage(Domain::Accounts, account_key(address), WriteOp::Delete);
    }

    /// Stages a storage write. Writes that leave the slot unchanged are dropped and zero
    /// values become deletes.
    fn write_storage(&mut self, address: &Address, slot: &B256, original: U256, value: U256) {
        if original == value {
            return;
        }
        let op = if value.is_zero() {
            WriteOp::Delete
        } else {
            WriteOp::Put(encode_storage_value(value))
        };
        self.stage(Domain::Storage, storage_key(address, slot), op);
    }
}

/// Per-task view over the latest committed state.
///
/// Reads fall through to the store unless the task already staged a write for the key,
/// and every store read is recorded so the reducer can detect a stale input at commit.
#[derive(derive_more::Debug)]
pub struct LiveView<'a> {
    #[debug(skip)]
    reader: &'a dyn StateReader,
    tx_num: TxNum,
    read_set: ReadSet,
    write_set: WriteSet,
    balance_increases: BTreeMap<Address, U256>,
}

impl<'a> LiveView<'a> {
    pub fn new(reader: &'a dyn StateReader, tx_num: TxNum) -> Self {
        Self {
            reader,
            tx_num,
            read_set: ReadSet::new(),
            write_set: WriteSet::default(),
            balance_increases: BTreeMap::new(),
        }
    }

    pub fn read_set(&self) -> &ReadSet {
        &self.read_set
    }

    pub fn write_set(&self) -> &WriteSet {
        &self.write_set
    }

    pub fn into_parts(self) -> (ReadSet, WriteSet, BTreeMap<Address, U256>) {
        (self.read_set, self.write_set, self.balance_increases)
    }
}

impl StateView for LiveView<'_> {
    fn tx_num(&self) -> TxNum {
        self.tx_num
    }

    fn get(&mut self, domain: Domain, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        if let Some(staged) = self.write_set.lookup(domain, key) {
            return Ok(staged);
        }
        let value = self.reader.get_latest(domain, key)?;
        self.read_set.push(StateRead {
            domain,
            key: Bytes::copy_from_slice(key),
            value: value.clone(),
        });
        Ok(value)
    }

    fn stage(&mut self, domain: Domain, key: Bytes, op: WriteOp) {
        self.write_set.push(domain, key, op);
    }

    fn increase_balance(&mut self, address: Address, amount: U256) {
        let pending = self.balance_increases.entry(address).or_default();
        *pending = pending.saturating_add(amount);
    }
}

/// Read-only view over finalized history, bound once per worker.
///
/// Writes are discarded: historical inputs are already committed.
#[derive(derive_more::Debug)]
pub struct HistoryView<'a> {
    #[debug(skip)]
    reader: &'a dyn HistoryReader,
    tx_num: TxNum,
}

impl<'a> HistoryView<'a> {
    pub fn new(reader: &'a dyn HistoryReader) -> Self {
        Self { reader, tx_num: 0 }
    }

    pub fn set_tx_num(&mut self, tx_num: TxNum) {
        self.tx_num = tx_num;
    }
}

impl StateView for HistoryView<'_> {
    fn tx_num(&self) -> TxNum {
        self.tx_num
    }

    fn get(&mut self, domain: Domain, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        self.reader.get_as_of(domain, key, self.tx_num)
    }

    fn stage(&mut self, _domain: Domain, _key: Bytes, _op: WriteOp) {}

    fn increase_balance(&mut self, _address: Address, _amount: U256) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speculative::memory::InMemoryStore;
    use alloy_primitives::address;

    const ALICE: Address = address!("0x000000000000000000000000000000000000a11c");

    fn store_with_alice(balance: u64) -> InMemoryStore {
        let store = InMemoryStore::new(4);
        store.insert_genesis_account(&ALICE, &Account::with_balance(U256::from(balance)));
        store
    }

    #[test]
    fn test_live_view_records_reads() {
        let store = store_with_alice(100);
        let mut view = LiveView::new(&store, 0);

        let account = view.read_account(&ALICE).unwrap().unwrap();
        assert_eq!(account.balance, U256::from(100));
        assert_eq!(view.read_storage(&ALICE, &B256::ZERO).unwrap(), U256::ZERO);

        assert_eq!(view.read_set().len(), 2);
        assert_eq!(view.read_set()[0].domain, Domain::Accounts);
        assert_eq!(view.read_set()[1].value, None);
    }

    #[test]
    fn test_live_view_reads_own_writes() {
        let store = store_with_alice(100);
        let mut view = LiveView::new(&store, 0);

        let mut account = view.read_account(&ALICE).unwrap().unwrap();
        account.nonce += 1;
        view.update_account(&ALICE, None, &account);

        assert_eq!(view.read_account(&ALICE).unwrap(), Some(account));
        // Only the first read went to the store.
        assert_eq!(view.read_set().len(), 1);
    }

    #[test]
    fn test_write_storage_skips_noop() {
        let store = InMemoryStore::new(4);
        let mut view = LiveView::new(&store, 0);
        let slot = B256::with_last_byte(1);

        view.write_storage(&ALICE, &slot, U256::from(5), U256::from(5));
        assert!(view.write_set().is_empty());

        view.write_storage(&ALICE, &slot, U256::from(5), U256::ZERO);
        view.write_storage(&ALICE, &slot, U256::ZERO, U256::from(9));
        let ops: Vec<&WriteOp> = view.write_set().iter().map(|(_, _, op)| op).collect();
        assert_eq!(ops[0], &WriteOp::Delete);
        assert_eq!(ops[1], &WriteOp::Put(encode_storage_value(U256::from(9))));
    }

    #[test]
    fn test_update_account_clears_previous_generation() {
        let store = InMemoryStore::new(4);
        let mut view = LiveView::new(&store, 0);
        let original = Account {
            incarnation: 2,
            ..Account::default()
        };
        let recreated = Account {
            incarnation: 1,
            ..Account::default()
        };

        view.update_account(&ALICE, Some(&original), &recreated);

        let staged: Vec<(Domain, WriteOp)> = view
            .write_set()
            .iter()
            .map(|(domain, _, op)| (domain, op.clone()))
            .collect();
        assert_eq!(
            staged,
            vec![
                (Domain::Accounts, WriteOp::Put(recreated.encode())),
                (Domain::Code, WriteOp::Delete),
                (Domain::Storage, WriteOp::DeletePrefix),
            ]
        );
    }

    #[test]
    fn test_balance_increases_accumulate() {
        let store = InMemoryStore::new(4);
        let mut view = LiveView::new(&store, 0);
        view.increase_balance(ALICE, U256::from(3));
        view.increase_balance(ALICE, U256::from(4));

        let (reads, writes, increases) = view.into_parts();
        assert!(reads.is_empty());
        assert!(writes.is_empty());
        assert_eq!(increases.get(&ALICE), Some(&U256::from(7)));
    }

    #[test]
    fn test_history_view_reads_as_of_and_discards_writes() {
        let store = store_with_alice(100);
        store.set_tx_num(5);
        store
            .put(
                Domain::Accounts,
                ALICE.as_slice(),
                &Account::with_balance(U256::from(50)).encode(),
            )
            .unwrap();

        let mut view = HistoryView::new(&store);
        view.set_tx_num(5);
        assert_eq!(view.read_account(&ALICE).unwrap().unwrap().balance, U256::from(100));
        view.set_tx_num(6);
        assert_eq!(view.read_account(&ALICE).unwrap().unwrap().balance, U256::from(50));

        view.delete_account(&ALICE);
        assert!(view.read_account(&ALICE).unwrap().is_some());
    }

    #[test]
    fn test_reads_valid_detects_changes() {
        let store = store_with_alice(100);
        let mut view = LiveView::new(&store, 0);
        view.read_account(&ALICE).unwrap();
        let (reads, _, _) = view.into_parts();
        assert!(store.reads_valid(&reads).unwrap());

        store.set_tx_num(0);
        store.delete(Domain::Accounts, ALICE.as_slice()).unwrap();
        assert!(!store.reads_valid(&reads).unwrap());
    }
}
