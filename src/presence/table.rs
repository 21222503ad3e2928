//! Presence table - per-room identity sets and the latest record per identity

use super::PresenceRecord;
use std::collections::HashMap;
use tracing::{debug, info, trace};

/// Result of merging one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// First record for this identity
    Inserted,
    /// Replaced an older record
    Updated,
    /// Older than (or identical to) what is already stored
    Ignored,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, Self::Ignored)
    }
}

/// Consistent copy of one room, handed to the renderer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room_name: String,
    /// Records in the room's identity order
    pub records: Vec<PresenceRecord>,
}

impl RoomSnapshot {
    pub fn get(&self, identity: &str) -> Option<&PresenceRecord> {
        self.records.iter().find(|r| r.identity == identity)
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.identity.as_str())
    }
}

#[derive(Debug, Default)]
pub struct PresenceTable {
    /// Identities per room, in order of first appearance
    rooms: HashMap<String, Vec<String>>,
    records: HashMap<String, PresenceRecord>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one record, last write wins by `operation_time`.
    ///
    /// An identity lives in exactly one room; a newer record for another room
    /// moves it there.
    pub fn merge(&mut self, record: PresenceRecord) -> MergeOutcome {
        let outcome = match self.records.get(&record.identity) {
            None => MergeOutcome::Inserted,
            Some(existing) if record.lww_key() > existing.lww_key() => MergeOutcome::Updated,
            Some(_) => {
                trace!(identity = %record.identity, "ignoring stale presence record");
                return MergeOutcome::Ignored;
            }
        };

        if let Some(previous) = self.records.get(&record.identity)
            && previous.room_name != record.room_name
        {
            let (from, to) = (previous.room_name.clone(), &record.room_name);
            debug!(identity = %record.identity, %from, %to, "identity moved rooms");
            self.detach(&from, &record.identity);
        }

        let members = self.rooms.entry(record.room_name.clone()).or_default();
        if !members.contains(&record.identity) {
            info!(identity = %record.identity, room = %record.room_name, "presence joined");
            members.push(record.identity.clone());
        }
        self.records.insert(record.identity.clone(), record);
        outcome
    }

    /// Merge every record of a snapshot that belongs to `room`.
    ///
    /// Identities missing from the snapshot are kept; expiry is left to
    /// [`PresenceTable::evict_older_than`].
    pub fn install_snapshot(&mut self, room: &str, records: Vec<PresenceRecord>) -> usize {
        let changed = records
            .into_iter()
            .filter(|r| r.room_name == room)
            .map(|r| self.merge(r))
            .filter(|o| o.changed())
            .count();
        debug!(%room, changed, "snapshot installed");
        changed
    }

    /// Remove `identity` from `room`. Returns whether anything was removed.
    pub fn remove(&mut self, room: &str, identity: &str) -> bool {
        match self.records.get(identity) {
            Some(record) if record.room_name == room => {
                self.records.remove(identity);
                self.detach(room, identity);
                info!(%identity, %room, "presence left");
                true
            }
            _ => false,
        }
    }

    /// Drop records in `room` whose `operation_time` is before `cutoff`,
    /// never touching `keep`. Returns the evicted identities.
    pub fn evict_older_than(&mut self, room: &str, cutoff: i64, keep: Option<&str>) -> Vec<String> {
        let expired: Vec<String> = self
            .identities(room)
            .iter()
            .filter(|id| Some(id.as_str()) != keep)
            .filter(|id| {
                self.records
                    .get(id.as_str())
                    .is_some_and(|r| r.operation_time < cutoff)
            })
            .cloned()
            .collect();

        for identity in &expired {
            self.remove(room, identity);
        }
        if !expired.is_empty() {
            debug!(%room, evicted = expired.len(), "expired presence evicted");
        }
        expired
    }

    pub fn get(&self, identity: &str) -> Option<&PresenceRecord> {
        self.records.get(identity)
    }

    /// Identities present in `room`, in order of first appearance.
    pub fn identities(&self, room: &str) -> &[String] {
        self.rooms.get(room).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn snapshot(&self, room: &str) -> RoomSnapshot {
        RoomSnapshot {
            room_name: room.to_string(),
            records: self
                .identities(room)
                .iter()
                .filter_map(|id| self.records.get(id))
                .cloned()
                .collect(),
        }
    }

    /// Number of live records across all rooms
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn detach(&mut self, room: &str, identity: &str) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.retain(|m| m != identity);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(identity: &str, room: &str, position: u8, op: i64) -> PresenceRecord {
        PresenceRecord {
            identity: identity.into(),
            room_name: room.into(),
            position,
            connected_at: 0,
            operation_time: op,
        }
    }

    #[test]
    fn newer_record_wins_in_any_order() {
        let old = record("a", "x", 10, 100);
        let new = record("a", "x", 60, 200);

        let mut forward = PresenceTable::new();
        forward.merge(old.clone());
        forward.merge(new.clone());

        let mut backward = PresenceTable::new();
        backward.merge(new.clone());
        assert_eq!(backward.merge(old), MergeOutcome::Ignored);

        assert_eq!(forward.get("a"), Some(&new));
        assert_eq!(backward.get("a"), Some(&new));
        assert_eq!(forward.snapshot("x"), backward.snapshot("x"));
    }

    #[test]
    fn merge_is_idempotent() {
        let mut table = PresenceTable::new();
        let r = record("a", "x", 10, 100);
        assert_eq!(table.merge(r.clone()), MergeOutcome::Inserted);
        assert_eq!(table.merge(r.clone()), MergeOutcome::Ignored);
        assert_eq!(table.len(), 1);
        assert_eq!(table.identities("x"), &["a".to_string()]);
    }

    #[test]
    fn equal_timestamps_resolve_the_same_both_ways() {
        let r1 = record("a", "x", 10, 100);
        let r2 = record("a", "x", 30, 100);

        let mut t1 = PresenceTable::new();
        t1.merge(r1.clone());
        t1.merge(r2.clone());
        let mut t2 = PresenceTable::new();
        t2.merge(r2);
        t2.merge(r1);

        assert_eq!(t1.get("a"), t2.get("a"));
    }

    #[test]
    fn one_record_per_identity() {
        let mut table = PresenceTable::new();
        table.merge(record("a", "x", 40, 1));
        table.merge(record("b", "x", 10, 2));
        table.merge(record("a", "x", 45, 3));

        assert_eq!(table.len(), 2);
        assert_eq!(table.identities("x"), &["a".to_string(), "b".to_string()]);
        assert_eq!(table.get("a").unwrap().position, 45);
    }

    #[test]
    fn identity_moving_rooms_leaves_the_old_one() {
        let mut table = PresenceTable::new();
        table.merge(record("a", "x", 40, 1));
        table.merge(record("a", "y", 5, 2));

        assert!(table.identities("x").is_empty());
        assert_eq!(table.identities("y"), &["a".to_string()]);
    }

    #[test]
    fn snapshot_ignores_other_rooms_and_keeps_missing() {
        let mut table = PresenceTable::new();
        table.merge(record("gone", "x", 1, 1));

        let changed = table.install_snapshot(
            "x",
            vec![record("a", "x", 20, 5), record("b", "y", 20, 5)],
        );
        assert_eq!(changed, 1);
        assert_eq!(
            table.identities("x"),
            &["gone".to_string(), "a".to_string()]
        );
        assert!(table.get("b").is_none());
    }

    #[test]
    fn remove_only_in_matching_room() {
        let mut table = PresenceTable::new();
        table.merge(record("a", "x", 40, 1));

        assert!(!table.remove("y", "a"));
        assert!(table.remove("x", "a"));
        assert!(table.is_empty());
        assert!(table.identities("x").is_empty());
    }

    #[test]
    fn eviction_spares_fresh_and_local() {
        let mut table = PresenceTable::new();
        table.merge(record("old", "x", 1, 100));
        table.merge(record("me", "x", 1, 100));
        table.merge(record("fresh", "x", 1, 900));

        let evicted = table.evict_older_than("x", 500, Some("me"));
        assert_eq!(evicted, vec!["old".to_string()]);
        assert_eq!(table.identities("x"), &["me".to_string(), "fresh".to_string()]);
    }
}
