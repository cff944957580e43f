use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::LedgerError;
use crate::models::{OrderHandle, OrderRecord, OrderStatus};

/// Outcome of applying a broker status to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Transitioned { from: OrderStatus, to: OrderStatus },
    Unchanged,
    /// Record already terminal; nothing was written
    TerminalLocked(OrderStatus),
}

#[derive(Debug, Default)]
struct LedgerInner {
    /// Handles in insertion order
    order: Vec<OrderHandle>,
    records: HashMap<OrderHandle, OrderRecord>,
}

/// Thread-safe, append-only record of accepted orders
///
/// Records are keyed by order handle and kept in insertion order for audit.
/// Entries are never removed; once a record reaches a terminal status it is
/// frozen.
#[derive(Debug, Default)]
pub struct TradeLedger {
    inner: RwLock<LedgerInner>,
}

impl TradeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new record; a handle may be recorded only once
    pub fn append(&self, record: OrderRecord) -> Result<(), LedgerError> {
        let mut inner = self.write();
        if inner.records.contains_key(&record.handle) {
            return Err(LedgerError::DuplicateHandle(record.handle));
        }

        inner.order.push(record.handle.clone());
        inner.records.insert(record.handle.clone(), record);
        Ok(())
    }

    pub fn get(&self, handle: &OrderHandle) -> Option<OrderRecord> {
        self.read().records.get(handle).cloned()
    }

    /// All records in insertion order
    pub fn snapshot(&self) -> Vec<OrderRecord> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|handle| inner.records.get(handle).cloned())
            .collect()
    }

    /// Records still awaiting a terminal status, in insertion order
    pub fn open_records(&self) -> Vec<OrderRecord> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|handle| inner.records.get(handle))
            .filter(|record| !record.status.is_terminal())
            .cloned()
            .collect()
    }

    pub fn records_for(&self, strategy_id: &str) -> Vec<OrderRecord> {
        self.snapshot()
            .into_iter()
            .filter(|record| record.strategy_id == strategy_id)
            .collect()
    }

    /// Apply a status observed at `checked_at`
    ///
    /// Terminal records are never modified.
    pub fn update_status(
        &self,
        handle: &OrderHandle,
        status: OrderStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<StatusUpdate, LedgerError> {
        let mut inner = self.write();
        let record = inner
            .records
            .get_mut(handle)
            .ok_or_else(|| LedgerError::UnknownHandle(handle.clone()))?;

        if record.status.is_terminal() {
            return Ok(StatusUpdate::TerminalLocked(record.status));
        }

        record.last_checked = Some(checked_at);
        if record.status == status {
            return Ok(StatusUpdate::Unchanged);
        }

        let from = record.status;
        record.status = status;
        Ok(StatusUpdate::Transitioned { from, to: status })
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
