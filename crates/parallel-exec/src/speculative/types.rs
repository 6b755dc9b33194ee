//! Core types for the speculative execution pipeline.
//!
//! This module defines the data every other component passes around:
//! - Sequence numbering and task kinds
//! - The per-block accumulator shared by all tasks of a block
//! - Account encoding and state domains
//! - Read/write tracking types

use crate::speculative::state::StoreError;
use alloy_primitives::{Address, B256, Bytes, KECCAK256_EMPTY, Log, U256};
use derive_more::Display;
use parking_lot::Mutex;
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

/// Global sequence number of a task. Dense and strictly increasing across a run;
/// every block occupies `tx_count + 2` numbers (start sentinel, transactions, end sentinel).
pub type TxNum = u64;

/// Block number a task belongs to.
pub type BlockNum = u64;

/// Incarnation number - incremented each time a task is handed back for another execution.
/// Starts at 0 for the first execution.
pub type Incarnation = u32;

/// What a task represents within its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum TaskKind {
    #[display("block_start")]
    BlockStart,
    #[display("tx({index})")]
    Transaction { index: usize },
    #[display("block_end")]
    BlockEnd,
}

/// Protocol rules that change how committed effects are applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rules {
    /// Accounts left with zero nonce, zero balance and no code are removed from state.
    pub empty_account_removal: bool,
}

/// Header metadata of a block, consumed opaquely by payload executors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: BlockNum,
    pub hash: B256,
    pub coinbase: Address,
    pub timestamp: u64,
    pub gas_limit: u64,
    pub rules: Rules,
}

/// One transaction handed to the producer.
#[derive(Debug, Clone)]
pub struct TxInput<T> {
    /// Origin used for same-sender dependency gating.
    pub sender: Option<Address>,
    pub tx: T,
}

/// One block handed to the producer.
#[derive(Debug, Clone)]
pub struct BlockInput<T> {
    pub header: BlockHeader,
    pub transactions: Vec<TxInput<T>>,
}

impl<T> BlockInput<T> {
    pub fn new(header: BlockHeader) -> Self {
        Self {
            header,
            transactions: Vec::new(),
        }
    }

    pub fn with_transaction(mut self, sender: Option<Address>, tx: T) -> Self {
        self.transactions.push(TxInput { sender, tx });
        self
    }

    /// Number of sequence numbers this block occupies.
    pub fn task_count(&self) -> u64 {
        self.transactions.len() as u64 + 2
    }
}

/// Receipt of a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_num: TxNum,
    pub index: usize,
    pub success: bool,
    pub gas_used: u64,
    pub cumulative_gas_used: u64,
    pub logs: Vec<Log>,
}

/// State shared by every task of one block.
///
/// The reducer fills the receipt slots in commit order, so the block end task and the
/// consumer always observe the receipts of every transaction committed before them.
#[derive(Debug)]
pub struct BlockContext {
    header: BlockHeader,
    tx_count: usize,
    receipts: Mutex<Vec<Option<Receipt>>>,
}

impl BlockContext {
    pub fn new(header: BlockHeader, tx_count: usize) -> Self {
        Self {
            header,
            tx_count,
            receipts: Mutex::new(vec![None; tx_count]),
        }
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn number(&self) -> BlockNum {
        self.header.number
    }

    pub fn rules(&self) -> Rules {
        self.header.rules
    }

    pub fn tx_count(&self) -> usize {
        self.tx_count
    }

    /// Records the receipt of transaction `index`, deriving the cumulative gas from the
    /// receipt before it.
    pub(crate) fn record_receipt(
        &self,
        tx_num: TxNum,
        index: usize,
        success: bool,
        gas_used: u64,
        logs: Vec<Log>,
    ) -> Receipt {
        let mut receipts = self.receipts.lock();
        let previous = index
            .checked_sub(1)
            .and_then(|prev| receipts.get(prev))
            .and_then(Option::as_ref)
            .map_or(0, |receipt| receipt.cumulative_gas_used);
        let receipt = Receipt {
            tx_num,
            index,
            success,
            gas_used,
            cumulative_gas_used: previous.saturating_add(gas_used),
            logs,
        };
        if let Some(slot) = receipts.get_mut(index) {
            *slot = Some(receipt.clone());
        }
        receipt
    }

    pub fn receipt(&self, index: usize) -> Option<Receipt> {
        self.receipts.lock().get(index).cloned().flatten()
    }

    /// Receipts committed so far, in block order.
    pub fn receipts(&self) -> Vec<Receipt> {
        self.receipts.lock().iter().map_while(Clone::clone).collect()
    }

    /// Cumulative gas of the last committed receipt.
    pub fn gas_used(&self) -> u64 {
        self.receipts
            .lock()
            .iter()
            .map_while(Option::as_ref)
            .last()
            .map_or(0, |receipt| receipt.cumulative_gas_used)
    }
}

/// Error captured on a task by the worker that executed it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The payload was rejected (e.g. an invalid transaction).
    #[error("execution failed: {0}")]
    Execution(String),
    /// The executor panicked; the worker recovered and kept running.
    #[error("executor panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One schedulable unit of work and, once executed, its result.
pub struct Task<T> {
    pub tx_num: TxNum,
    pub kind: TaskKind,
    /// Transaction body; absent for block sentinels.
    pub tx: Option<T>,
    pub sender: Option<Address>,
    pub block: Arc<BlockContext>,
    /// Inputs are finalized history: reads resolve as of `tx_num` and state writes are not
    /// applied at commit.
    pub history_execution: bool,
    pub incarnation: Incarnation,

    pub error: Option<TaskError>,
    /// The transaction reverted. Reverted transactions are still committed.
    pub failed: bool,
    pub gas_used: u64,
    pub logs: Vec<Log>,
    pub read_set: ReadSet,
    pub write_set: WriteSet,
    pub balance_increases: BTreeMap<Address, U256>,
    pub trace_froms: BTreeSet<Address>,
    pub trace_tos: BTreeSet<Address>,
}

impl<T> Task<T> {
    pub fn new(
        tx_num: TxNum,
        kind: TaskKind,
        tx: Option<T>,
        sender: Option<Address>,
        block: Arc<BlockContext>,
    ) -> Self {
        Self {
            tx_num,
            kind,
            tx,
            sender,
            block,
            history_execution: false,
            incarnation: 0,
            error: None,
            failed: false,
            gas_used: 0,
            logs: Vec::new(),
            read_set: ReadSet::new(),
            write_set: WriteSet::default(),
            balance_increases: BTreeMap::new(),
            trace_froms: BTreeSet::new(),
            trace_tos: BTreeSet::new(),
        }
    }

    pub fn block_start(tx_num: TxNum, block: Arc<BlockContext>) -> Self {
        Self::new(tx_num, TaskKind::BlockStart, None, None, block)
    }

    pub fn transaction(
        tx_num: TxNum,
        index: usize,
        sender: Option<Address>,
        tx: T,
        block: Arc<BlockContext>,
    ) -> Self {
        Self::new(tx_num, TaskKind::Transaction { index }, Some(tx), sender, block)
    }

    pub fn block_end(tx_num: TxNum, block: Arc<BlockContext>) -> Self {
        Self::new(tx_num, TaskKind::BlockEnd, None, None, block)
    }

    pub fn block_num(&self) -> BlockNum {
        self.block.number()
    }

    /// Index within the block for transaction tasks.
    pub fn tx_index(&self) -> Option<usize> {
        match self.kind {
            TaskKind::Transaction { index } => Some(index),
            TaskKind::BlockStart | TaskKind::BlockEnd => None,
        }
    }

    pub fn is_block_start(&self) -> bool {
        self.kind == TaskKind::BlockStart
    }

    pub fn is_block_end(&self) -> bool {
        self.kind == TaskKind::BlockEnd
    }

    /// Clears every result field so the task can be executed again.
    pub fn reset(&mut self) {
        self.error = None;
        self.failed = false;
        self.gas_used = 0;
        self.logs.clear();
        self.read_set.clear();
        self.write_set.clear();
        self.balance_increases.clear();
        self.trace_froms.clear();
        self.trace_tos.clear();
    }

    pub(crate) fn prepare_retry(&mut self) {
        self.reset();
        self.incarnation += 1;
    }

    /// Drops the read and write sets once they have been applied.
    pub(crate) fn release_sets(&mut self) {
        self.read_set = ReadSet::new();
        self.write_set = WriteSet::default();
        self.balance_increases = BTreeMap::new();
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("tx_num", &self.tx_num)
            .field("block_num", &self.block_num())
            .field("kind", &self.kind)
            .field("sender", &self.sender)
            .field("incarnation", &self.incarnation)
            .field("error", &self.error)
            .field("failed", &self.failed)
            .field("gas_used", &self.gas_used)
            .finish_non_exhaustive()
    }
}

/// Orders tasks by ascending sequence number inside a max-heap.
pub(crate) struct BySequence<T>(pub(crate) Task<T>);

impl<T> PartialEq for BySequence<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0.tx_num == other.0.tx_num
    }
}

impl<T> Eq for BySequence<T> {}

impl<T> PartialOrd for BySequence<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for BySequence<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.tx_num.cmp(&self.0.tx_num)
    }
}

/// Key/value domains of the versioned state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub enum Domain {
    #[display("accounts")]
    Accounts,
    #[display("storage")]
    Storage,
    #[display("code")]
    Code,
}

impl Domain {
    pub const ALL: [Domain; 3] = [Domain::Accounts, Domain::Storage, Domain::Code];

    /// Order in which a write set is applied.
    pub const APPLY_ORDER: [Domain; 3] = [Domain::Accounts, Domain::Code, Domain::Storage];

    pub(crate) fn slot(self) -> usize {
        match self {
            Domain::Accounts => 0,
            Domain::Storage => 1,
            Domain::Code => 2,
        }
    }

    fn apply_rank(self) -> usize {
        match self {
            Domain::Accounts => 0,
            Domain::Code => 1,
            Domain::Storage => 2,
        }
    }
}

/// Secondary index tables fed from committed logs and traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub enum IndexTable {
    #[display("log_address")]
    LogAddress,
    #[display("log_topics")]
    LogTopics,
    #[display("traces_from")]
    TracesFrom,
    #[display("traces_to")]
    TracesTo,
}

pub fn account_key(address: &Address) -> Bytes {
    Bytes::copy_from_slice(address.as_slice())
}

/// Storage keys are the account address followed by the slot, so an account's storage
/// shares the address as a prefix.
pub fn storage_key(address: &Address, slot: &B256) -> Bytes {
    let mut key = Vec::with_capacity(20 + 32);
    key.extend_from_slice(address.as_slice());
    key.extend_from_slice(slot.as_slice());
    key.into()
}

pub fn encode_storage_value(value: U256) -> Bytes {
    value.to_be_bytes_trimmed_vec().into()
}

pub fn decode_storage_value(raw: &[u8]) -> Result<U256, StoreError> {
    U256::try_from_be_slice(raw).ok_or(StoreError::InvalidStorageValue { len: raw.len() })
}

/// Account record as stored in the accounts domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
    pub code_hash: B256,
    /// Storage generation; bumped when a contract is re-created at the same address.
    pub incarnation: u64,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: U256::ZERO,
            code_hash: KECCAK256_EMPTY,
            incarnation: 0,
        }
    }
}

impl Account {
    pub const ENCODED_LEN: usize = 8 + 32 + 32 + 8;

    pub fn with_balance(balance: U256) -> Self {
        Self {
            balance,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nonce == 0
            && self.balance.is_zero()
            && (self.code_hash == KECCAK256_EMPTY || self.code_hash == B256::ZERO)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf.extend_from_slice(&self.balance.to_be_bytes::<32>());
        buf.extend_from_slice(self.code_hash.as_slice());
        buf.extend_from_slice(&self.incarnation.to_be_bytes());
        buf.into()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, StoreError> {
        if raw.len() != Self::ENCODED_LEN {
            return Err(StoreError::InvalidAccount {
                expected: Self::ENCODED_LEN,
                got: raw.len(),
            });
        }
        Ok(Self {
            nonce: be_u64(&raw[0..8]),
            balance: U256::from_be_slice(&raw[8..40]),
            code_hash: B256::from_slice(&raw[40..72]),
            incarnation: be_u64(&raw[72..80]),
        })
    }
}

fn be_u64(raw: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(raw);
    u64::from_be_bytes(buf)
}

/// A value observed by a live read, kept for commit-time validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRead {
    pub domain: Domain,
    pub key: Bytes,
    pub value: Option<Bytes>,
}

pub type ReadSet = Vec<StateRead>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put(Bytes),
    Delete,
    /// Deletes every key starting with the entry's key.
    DeletePrefix,
}

/// Writes staged by one task, grouped per domain.
///
/// Entries keep insertion order within a domain so the last logical write to a key wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSet {
    lists: [Vec<(Bytes, WriteOp)>; 3],
}

impl WriteSet {
    pub fn push(&mut self, domain: Domain, key: Bytes, op: WriteOp) {
        self.lists[domain.apply_rank()].push((key, op));
    }

    /// Entries in apply order: accounts, then code, then storage.
    pub fn iter(&self) -> impl Iterator<Item = (Domain, &Bytes, &WriteOp)> + '_ {
        Domain::APPLY_ORDER
            .into_iter()
            .zip(self.lists.iter())
            .flat_map(|(domain, list)| list.iter().map(move |(key, op)| (domain, key, op)))
    }

    /// Latest staged value for `key`: `Some(None)` when it was deleted, `None` when the set
    /// never touched it.
    pub fn lookup(&self, domain: Domain, key: &[u8]) -> Option<Option<Bytes>> {
        self.lists[domain.apply_rank()]
            .iter()
            .rev()
            .find_map(|(staged, op)| match op {
                WriteOp::Put(value) if staged[..] == *key => Some(Some(value.clone())),
                WriteOp::Delete if staged[..] == *key => Some(None),
                WriteOp::DeletePrefix if key.starts_with(staged) => Some(None),
                _ => None,
            })
    }

    pub fn len(&self) -> usize {
        self.lists.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.iter().all(Vec::is_empty)
    }

    pub fn clear(&mut self) {
        self.lists.iter_mut().for_each(Vec::clear);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256};

    fn context(tx_count: usize) -> Arc<BlockContext> {
        Arc::new(BlockContext::new(BlockHeader::default(), tx_count))
    }

    #[test]
    fn test_account_encoding() {
        let account = Account {
            nonce: 7,
            balance: U256::from(1_000_000u64),
            code_hash: b256!("0x1111111111111111111111111111111111111111111111111111111111111111"),
            incarnation: 2,
        };
        let encoded = account.encode();
        assert_eq!(encoded.len(), Account::ENCODED_LEN);
        assert_eq!(Account::decode(&encoded), Ok(account));

        assert_eq!(
            Account::decode(&encoded[..10]),
            Err(StoreError::InvalidAccount {
                expected: Account::ENCODED_LEN,
                got: 10
            })
        );
    }

    #[test]
    fn test_account_emptiness() {
        assert!(Account::default().is_empty());
        assert!(!Account::with_balance(U256::from(1)).is_empty());
        assert!(
            !Account {
                nonce: 1,
                ..Account::default()
            }
            .is_empty()
        );
        assert!(
            !Account {
                code_hash: B256::repeat_byte(0xaa),
                ..Account::default()
            }
            .is_empty()
        );
    }

    #[test]
    fn test_storage_value_encoding() {
        assert!(encode_storage_value(U256::ZERO).is_empty());
        assert_eq!(&encode_storage_value(U256::from(0x0102))[..], &[0x01, 0x02]);
        assert_eq!(decode_storage_value(&[0x01, 0x02]), Ok(U256::from(0x0102)));
        assert_eq!(
            decode_storage_value(&[0u8; 33]),
            Err(StoreError::InvalidStorageValue { len: 33 })
        );
    }

    #[test]
    fn test_write_set_apply_order() {
        let addr = address!("0x00000000000000000000000000000000000000aa");
        let mut writes = WriteSet::default();
        writes.push(Domain::Storage, storage_key(&addr, &B256::ZERO), WriteOp::Delete);
        writes.push(Domain::Code, account_key(&addr), WriteOp::Put(Bytes::from_static(b"code")));
        writes.push(Domain::Accounts, account_key(&addr), WriteOp::Delete);

        let domains: Vec<Domain> = writes.iter().map(|(domain, _, _)| domain).collect();
        assert_eq!(domains, vec![Domain::Accounts, Domain::Code, Domain::Storage]);
        assert_eq!(writes.len(), 3);

        writes.clear();
        assert!(writes.is_empty());
    }

    #[test]
    fn test_write_set_lookup_last_writer_wins() {
        let addr = address!("0x00000000000000000000000000000000000000bb");
        let slot = storage_key(&addr, &B256::with_last_byte(1));
        let mut writes = WriteSet::default();

        assert_eq!(writes.lookup(Domain::Storage, &slot), None);

        writes.push(Domain::Storage, slot.clone(), WriteOp::Put(Bytes::from_static(&[1])));
        writes.push(Domain::Storage, slot.clone(), WriteOp::Put(Bytes::from_static(&[2])));
        assert_eq!(
            writes.lookup(Domain::Storage, &slot),
            Some(Some(Bytes::from_static(&[2])))
        );

        writes.push(Domain::Storage, account_key(&addr), WriteOp::DeletePrefix);
        assert_eq!(writes.lookup(Domain::Storage, &slot), Some(None));
    }

    #[test]
    fn test_receipts_accumulate_gas() {
        let block = context(3);
        block.record_receipt(1, 0, true, 21_000, vec![]);
        let second = block.record_receipt(2, 1, false, 50_000, vec![]);
        assert_eq!(second.cumulative_gas_used, 71_000);
        assert_eq!(block.receipts().len(), 2);
        assert_eq!(block.gas_used(), 71_000);
        assert!(block.receipt(2).is_none());
    }

    #[test]
    fn test_cumulative_gas_saturates() {
        let block = context(2);
        block.record_receipt(1, 0, true, 21_000, vec![]);
        let second = block.record_receipt(2, 1, true, u64::MAX, vec![]);
        assert_eq!(second.gas_used, u64::MAX);
        assert_eq!(second.cumulative_gas_used, u64::MAX);
    }

    #[test]
    fn test_reset_clears_results() {
        let mut task = Task::transaction(4, 0, None, (), context(1));
        task.error = Some(TaskError::Execution("boom".into()));
        task.failed = true;
        task.gas_used = 10;
        task.trace_froms.insert(Address::ZERO);
        task.write_set.push(Domain::Accounts, Bytes::new(), WriteOp::Delete);

        task.prepare_retry();

        assert!(task.error.is_none());
        assert!(!task.failed);
        assert_eq!(task.gas_used, 0);
        assert!(task.trace_froms.is_empty());
        assert!(task.write_set.is_empty());
        assert_eq!(task.incarnation, 1);
    }

    #[test]
    fn test_by_sequence_is_min_heap() {
        let block = context(0);
        let mut heap = std::collections::BinaryHeap::new();
        for tx_num in [5, 1, 3] {
            heap.push(BySequence(Task::<()>::block_start(tx_num, Arc::clone(&block))));
        }
        let order: Vec<TxNum> = std::iter::from_fn(|| heap.pop().map(|t| t.0.tx_num)).collect();
        assert_eq!(order, vec![1, 3, 5]);
    }
}
