//! Per-process I/O accounting.
//!
//! Every admitted operation bumps an `(operations, bytes)` pair for its
//! process in one of three buckets. Updates are plain atomic increments and
//! the process table is read through an atomically swapped snapshot, so no
//! recording thread ever takes a lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operating-system process identifier.
pub type ProcessId = u32;

/// Bucket an operation is accounted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoClass {
    /// Content reads.
    Read,
    /// Content writes.
    Write,
    /// Everything else: probes, enumerations, metadata changes.
    Other,
}

/// Errors decoding a fixed-size wire record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The buffer does not hold exactly one record.
    #[error("expected {expected} bytes, got {actual}")]
    Length {
        /// Required length.
        expected: usize,
        /// Provided length.
        actual: usize,
    },
    /// A field holds a value outside its domain.
    #[error("invalid {field} value {value}")]
    InvalidField {
        /// Name of the field.
        field: &'static str,
        /// Raw value found.
        value: u8,
    },
}

/// Operation and transfer counts for one I/O class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IoTypeCounters {
    /// Number of operations.
    pub operation_count: u64,
    /// Number of bytes transferred.
    pub transfer_count: u64,
}

impl IoTypeCounters {
    /// Create a counter pair.
    pub const fn new(operation_count: u64, transfer_count: u64) -> Self {
        Self {
            operation_count,
            transfer_count,
        }
    }

    /// Add two pairs; if either field would overflow, both reset to zero.
    pub fn saturating_add(self, other: Self) -> Self {
        match (
            self.operation_count.checked_add(other.operation_count),
            self.transfer_count.checked_add(other.transfer_count),
        ) {
            (Some(operation_count), Some(transfer_count)) => Self {
                operation_count,
                transfer_count,
            },
            _ => {
                tracing::debug!(?self, ?other, "io counter overflow, resetting to zero");
                Self::default()
            }
        }
    }
}

/// Read, write and other counters of a process or process tree.
///
/// Persisted verbatim as six little-endian `u64` fields with no padding:
/// `ReadOps, ReadBytes, WriteOps, WriteBytes, OtherOps, OtherBytes`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IoCounters {
    /// Content reads.
    pub read: IoTypeCounters,
    /// Content writes.
    pub write: IoTypeCounters,
    /// Other operations.
    pub other: IoTypeCounters,
}

impl IoCounters {
    /// Size of the binary layout.
    pub const ENCODED_LEN: usize = 6 * size_of::<u64>();

    /// Counters for one class.
    pub fn get(&self, class: IoClass) -> IoTypeCounters {
        match class {
            IoClass::Read => self.read,
            IoClass::Write => self.write,
            IoClass::Other => self.other,
        }
    }

    /// Sum over all three classes, resetting to zero on overflow.
    pub fn aggregate(&self) -> IoTypeCounters {
        self.read.saturating_add(self.write).saturating_add(self.other)
    }

    /// Class-wise sum, each class resetting to zero on overflow.
    pub fn saturating_add(self, other: Self) -> Self {
        Self {
            read: self.read.saturating_add(other.read),
            write: self.write.saturating_add(other.write),
            other: self.other.saturating_add(other.other),
        }
    }

    /// Encode into the fixed binary layout.
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let fields = [
            self.read.operation_count,
            self.read.transfer_count,
            self.write.operation_count,
            self.write.transfer_count,
            self.other.operation_count,
            self.other.transfer_count,
        ];
        let mut out = [0u8; Self::ENCODED_LEN];
        for (chunk, field) in out.chunks_exact_mut(size_of::<u64>()).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        out
    }

    /// Decode from the fixed binary layout.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(CodecError::Length {
                expected: Self::ENCODED_LEN,
                actual: bytes.len(),
            });
        }
        let mut fields = [0u64; 6];
        for (field, chunk) in fields.iter_mut().zip(bytes.chunks_exact(size_of::<u64>())) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *field = u64::from_le_bytes(raw);
        }
        Ok(Self {
            read: IoTypeCounters::new(fields[0], fields[1]),
            write: IoTypeCounters::new(fields[2], fields[3]),
            other: IoTypeCounters::new(fields[4], fields[5]),
        })
    }
}

/// Lock-free counter pair.
#[derive(Debug, Default)]
struct AtomicIoTypeCounters {
    operations: AtomicU64,
    transfers: AtomicU64,
}

impl AtomicIoTypeCounters {
    /// Returns `true` when the pair overflowed and was reset.
    fn record(&self, operations: u64, bytes: u64) -> bool {
        let ops_overflow = self
            .operations
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_add(operations))
            .is_err();
        let bytes_overflow = self
            .transfers
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_add(bytes))
            .is_err();
        if ops_overflow || bytes_overflow {
            self.operations.store(0, Ordering::Relaxed);
            self.transfers.store(0, Ordering::Relaxed);
            return true;
        }
        false
    }

    fn load(&self) -> IoTypeCounters {
        IoTypeCounters::new(
            self.operations.load(Ordering::Relaxed),
            self.transfers.load(Ordering::Relaxed),
        )
    }
}

/// Parent slot value before any parent is linked.
const NO_PARENT: u64 = u64::MAX;

#[derive(Debug)]
struct ProcessEntry {
    parent: AtomicU64,
    read: AtomicIoTypeCounters,
    write: AtomicIoTypeCounters,
    other: AtomicIoTypeCounters,
}

impl Default for ProcessEntry {
    fn default() -> Self {
        Self {
            parent: AtomicU64::new(NO_PARENT),
            read: AtomicIoTypeCounters::default(),
            write: AtomicIoTypeCounters::default(),
            other: AtomicIoTypeCounters::default(),
        }
    }
}

impl ProcessEntry {
    fn bucket(&self, class: IoClass) -> &AtomicIoTypeCounters {
        match class {
            IoClass::Read => &self.read,
            IoClass::Write => &self.write,
            IoClass::Other => &self.other,
        }
    }

    fn parent(&self) -> Option<ProcessId> {
        ProcessId::try_from(self.parent.load(Ordering::Acquire)).ok()
    }

    /// Link `parent` unless a parent is already known.
    fn link_parent(&self, parent: ProcessId) {
        let _ = self.parent.compare_exchange(
            NO_PARENT,
            u64::from(parent),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn snapshot(&self) -> IoCounters {
        IoCounters {
            read: self.read.load(),
            write: self.write.load(),
            other: self.other.load(),
        }
    }
}

type ProcessTable = HashMap<ProcessId, Arc<ProcessEntry>>;

/// I/O counters for every observed process of a job.
///
/// The table is an immutable snapshot swapped atomically. Recording against a
/// process already in the snapshot is an atomic load plus atomic increments.
/// Adding or retiring processes copies the snapshot and publishes the copy
/// with a compare-and-swap, so neither ever makes a recording thread wait.
///
/// Parent linkage comes from the process-lifecycle collaborator through
/// [`register_process`](Self::register_process) (or the parent id carried by
/// an access request); this type never enumerates processes itself.
#[derive(Debug)]
pub struct ProcessAccounting {
    processes: ArcSwap<ProcessTable>,
}

impl Default for ProcessAccounting {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessAccounting {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            processes: ArcSwap::from_pointee(ProcessTable::new()),
        }
    }

    /// Record that `pid` exists, optionally as a child of `parent`.
    ///
    /// The first known parent of a process wins; later calls only fill in a
    /// missing link.
    pub fn register_process(&self, pid: ProcessId, parent: Option<ProcessId>) {
        self.entry(pid, parent);
    }

    /// Count one operation of `bytes` bytes for `pid`.
    pub fn record_operation(&self, pid: ProcessId, class: IoClass, bytes: u64) {
        self.record(pid, None, class, bytes);
    }

    pub(crate) fn record(&self, pid: ProcessId, parent: Option<ProcessId>, class: IoClass, bytes: u64) {
        let entry = self.entry(pid, parent);
        if entry.bucket(class).record(1, bytes) {
            tracing::debug!(pid, ?class, "io counter overflow, resetting to zero");
        }
    }

    /// Counters of a single process, if it was observed.
    pub fn counters(&self, pid: ProcessId) -> Option<IoCounters> {
        self.processes.load().get(&pid).map(|entry| entry.snapshot())
    }

    /// Number of processes currently tracked.
    pub fn process_count(&self) -> usize {
        self.processes.load().len()
    }

    /// `root` and every known descendant, `root` first.
    ///
    /// Unknown roots yield an empty list. Cycles from reused process ids are
    /// cut at the first repeat.
    pub fn process_tree(&self, root: ProcessId) -> Vec<ProcessId> {
        Self::collect_tree(&self.processes.load(), root)
    }

    /// Sum the counters of `root` and all of its known descendants.
    pub fn aggregate(&self, root: ProcessId) -> IoCounters {
        let table = self.processes.load_full();
        Self::sum_tree(&table, &Self::collect_tree(&table, root))
    }

    /// Aggregate a torn-down process tree and forget its processes.
    pub fn retire_tree(&self, root: ProcessId) -> IoCounters {
        let previous = self.processes.rcu(|table| {
            let mut next = ProcessTable::clone(table);
            for pid in Self::collect_tree(table, root) {
                next.remove(&pid);
            }
            next
        });
        // The swap succeeded against `previous`, so its tree is what was removed.
        let members = Self::collect_tree(&previous, root);
        let total = Self::sum_tree(&previous, &members);
        tracing::debug!(root, processes = members.len(), "retired process tree");
        total
    }

    fn entry(&self, pid: ProcessId, parent: Option<ProcessId>) -> Arc<ProcessEntry> {
        let existing = self.processes.load().get(&pid).cloned();
        let entry = existing.unwrap_or_else(|| self.insert(pid));
        if let Some(parent) = parent
            && parent != pid
        {
            entry.link_parent(parent);
        }
        entry
    }

    /// Publish a table containing `pid`, returning whichever entry won.
    fn insert(&self, pid: ProcessId) -> Arc<ProcessEntry> {
        let fresh = Arc::new(ProcessEntry::default());
        let previous = self.processes.rcu(|table| {
            let mut next = ProcessTable::clone(table);
            next.entry(pid).or_insert_with(|| Arc::clone(&fresh));
            next
        });
        previous.get(&pid).cloned().unwrap_or(fresh)
    }

    fn sum_tree(table: &ProcessTable, members: &[ProcessId]) -> IoCounters {
        members
            .iter()
            .filter_map(|pid| table.get(pid))
            .fold(IoCounters::default(), |acc, entry| acc.saturating_add(entry.snapshot()))
    }

    fn collect_tree(table: &ProcessTable, root: ProcessId) -> Vec<ProcessId> {
        if !table.contains_key(&root) {
            return Vec::new();
        }

        let mut children: HashMap<ProcessId, Vec<ProcessId>> = HashMap::new();
        for (pid, entry) in table {
            if let Some(parent) = entry.parent() {
                children.entry(parent).or_default().push(*pid);
            }
        }

        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut pending = vec![root];
        while let Some(pid) = pending.pop() {
            if !seen.insert(pid) {
                continue;
            }
            order.push(pid);
            if let Some(kids) = children.get(&pid) {
                pending.extend(kids.iter().copied());
            }
        }
        order
    }
}
