//! Append-only command log with structural sharing.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::record::{CommandRecord, RECORD_SIZE};
use super::CommandDescriptor;
use crate::error::{Result, ShaderError};

/// Ordered sequence of command records.
///
/// A log is a length-limited view over a shared backing store. Appending to
/// the newest view of a store pushes in place; appending to an older view
/// copies that view's prefix first. Either way the view appended to is left
/// untouched, so upstream stages can hand the same log to several consumers.
#[derive(Clone, Default)]
pub struct CommandLog {
    store: Arc<Mutex<Vec<CommandRecord>>>,
    len: usize,
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a new log holding this log's records followed by `record`.
    pub fn appended(&self, record: CommandRecord) -> CommandLog {
        let mut records = lock(&self.store);
        if records.len() == self.len {
            records.push(record);
            return CommandLog {
                store: Arc::clone(&self.store),
                len: self.len + 1,
            };
        }

        // Another consumer already extended this prefix.
        let mut forked = Vec::with_capacity(self.len + 1);
        forked.extend_from_slice(&records[..self.len]);
        forked.push(record);
        CommandLog {
            store: Arc::new(Mutex::new(forked)),
            len: self.len + 1,
        }
    }

    /// Runs `f` over the records visible through this view.
    pub fn with_records<R>(&self, f: impl FnOnce(&[CommandRecord]) -> R) -> R {
        let records = lock(&self.store);
        f(&records[..self.len])
    }

    /// Decodes every record, in sequence order.
    pub fn descriptors(&self) -> Result<Vec<CommandDescriptor>> {
        self.with_records(|records| records.iter().map(CommandRecord::decode).collect())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.with_records(|records| bytemuck::cast_slice(records).to_vec())
    }

    /// Rebuilds a log from bytes produced by [`CommandLog::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % RECORD_SIZE != 0 {
            return Err(ShaderError::CorruptRecord {
                reason: format!(
                    "{} bytes is not a whole number of {RECORD_SIZE}-byte records",
                    bytes.len()
                ),
            });
        }
        let records: Vec<CommandRecord> = bytes
            .chunks_exact(RECORD_SIZE)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        for (expected, record) in records.iter().enumerate() {
            if record.sequence_index as usize != expected {
                return Err(ShaderError::CorruptRecord {
                    reason: format!(
                        "record {expected} carries sequence index {}",
                        record.sequence_index
                    ),
                });
            }
            record.decode()?;
        }
        Ok(CommandLog {
            len: records.len(),
            store: Arc::new(Mutex::new(records)),
        })
    }
}

impl std::fmt::Debug for CommandLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandLog").field("len", &self.len).finish()
    }
}

// Records below a view's length are never modified, so a poisoned lock
// still guards consistent data.
fn lock(store: &Mutex<Vec<CommandRecord>>) -> MutexGuard<'_, Vec<CommandRecord>> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}
