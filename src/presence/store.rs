//! Shared handle to the presence table
//!
//! Writers flag the table dirty and wake waiters; readers take a room snapshot
//! under the lock and render from the copy.

use super::table::{PresenceTable, RoomSnapshot};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct PresenceStore {
    table: Arc<Mutex<PresenceTable>>,
    dirty: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutate the table. The closure's result decides whether readers are
    /// told about a change.
    pub fn update<R>(&self, f: impl FnOnce(&mut PresenceTable) -> R) -> Option<R>
    where
        R: Changed,
    {
        let result = match self.table.lock() {
            Ok(mut table) => f(&mut table),
            Err(_) => {
                warn!("presence table lock poisoned");
                return None;
            }
        };
        if result.changed() {
            self.dirty.store(true, Ordering::Relaxed);
            self.notify.notify_waiters();
        }
        Some(result)
    }

    /// Read the table without flagging a change.
    pub fn read<R>(&self, f: impl FnOnce(&PresenceTable) -> R) -> Option<R> {
        self.table.lock().ok().map(|table| f(&table))
    }

    pub fn snapshot(&self, room: &str) -> RoomSnapshot {
        self.read(|t| t.snapshot(room)).unwrap_or_default()
    }

    /// Clear and return the dirty flag.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    /// Wait until the table is dirty. Returns at once if it already is; the
    /// caller clears the flag with [`PresenceStore::take_dirty`].
    pub async fn changed(&self) {
        let mut notified = std::pin::pin!(self.notify.notified());
        notified.as_mut().enable();
        if self.dirty.load(Ordering::Relaxed) {
            return;
        }
        notified.await;
    }
}

/// Whether a table mutation changed anything
pub trait Changed {
    fn changed(&self) -> bool;
}

impl Changed for bool {
    fn changed(&self) -> bool {
        *self
    }
}

impl Changed for usize {
    fn changed(&self) -> bool {
        *self > 0
    }
}

impl Changed for super::MergeOutcome {
    fn changed(&self) -> bool {
        super::MergeOutcome::changed(*self)
    }
}

impl<T> Changed for Vec<T> {
    fn changed(&self) -> bool {
        !self.is_empty()
    }
}
