//! The in-memory index mapping every live key to the location of its latest value.

use std::collections::HashMap;

use dashmap::DashMap;

use crate::error::Result;
use crate::record::Record;
use crate::segment::LogSegment;

/// Location of a value on disk.
///
/// The segment is referenced by number and resolved through the store's segment registry
/// at read time, so a reference never keeps a closed or renamed file alive by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueReference {
    /// Number of the segment holding the value
    pub segment_id: u64,
    /// Byte offset of the value within the segment
    pub offset: u64,
    /// Size of the value in bytes
    pub value_size: u32,
    /// Expiry instant in milliseconds since UNIX epoch, `0` for never
    pub ttl: u64,
    /// Timestamp of the record the value belongs to
    pub timestamp: u64,
}

impl ValueReference {
    /// Reference to the value of `record`, which was just appended to `segment`.
    ///
    /// Only valid immediately after the append: the value ends at the segment's
    /// current position.
    pub fn of_appended(record: &Record, segment: &LogSegment) -> Result<Self> {
        let offset = segment.position()? - record.value_size() as u64;
        Ok(Self {
            segment_id: segment.id(),
            offset,
            value_size: record.value_size() as u32,
            ttl: record.header.ttl,
            timestamp: record.header.timestamp,
        })
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.ttl > 0 && now > self.ttl
    }
}

/// Entry of a keydir built from a single segment.
///
/// `Tombstone` records that the segment deletes (or expires) the key, which is different
/// from the segment never mentioning it: when partial keydirs are merged it removes any
/// value contributed by an older segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialEntry {
    Value(ValueReference),
    Tombstone { timestamp: u64 },
}

impl PartialEntry {
    pub fn timestamp(&self) -> u64 {
        match self {
            PartialEntry::Value(value) => value.timestamp,
            PartialEntry::Tombstone { timestamp } => *timestamp,
        }
    }
}

/// Keydir of one segment, as produced by [`LogSegment::build_keydir`].
#[derive(Debug, Default)]
pub struct PartialKeyDir {
    pub entries: HashMap<Vec<u8>, PartialEntry>,
    /// Highest timestamp of any record in the segment, tombstones and expired records
    /// included
    pub max_timestamp: u64,
    /// Set for compaction outputs, whose records may predate lower-numbered segments
    pub compacted: bool,
}

impl PartialKeyDir {
    pub fn new(compacted: bool) -> Self {
        Self {
            compacted,
            ..Self::default()
        }
    }

    /// Records `entry` for `key`. A later call for the same key replaces the earlier one.
    pub fn insert(&mut self, key: Vec<u8>, entry: PartialEntry) {
        self.max_timestamp = self.max_timestamp.max(entry.timestamp());
        self.entries.insert(key, entry);
    }

    pub fn get(&self, key: &[u8]) -> Option<&PartialEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Concurrent key directory.
///
/// Backed by a sharded map: client threads and the log cleaner update individual keys
/// without a lock over the whole index.
#[derive(Debug, Default)]
pub struct KeyDir {
    entries: DashMap<Vec<u8>, ValueReference>,
}

impl KeyDir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges per-segment keydirs into the store keydir.
    ///
    /// Partial keydirs are applied in ascending segment order so the entry of the highest
    /// segment wins, tombstones included. Compaction outputs are the exception: they are
    /// numbered above the segment that was active while they were written and may hold
    /// copies that a write to that segment superseded, so their entries never replace
    /// one carrying a strictly newer timestamp.
    pub fn merge(mut partials: Vec<(u64, PartialKeyDir)>) -> Self {
        partials.sort_by_key(|(segment_id, _)| *segment_id);

        let mut merged: HashMap<Vec<u8>, PartialEntry> = HashMap::new();
        for (_, partial) in partials {
            let compacted = partial.compacted;
            for (key, entry) in partial.entries {
                match merged.get(&key) {
                    Some(existing) if compacted && existing.timestamp() > entry.timestamp() => {}
                    _ => {
                        merged.insert(key, entry);
                    }
                }
            }
        }

        let entries = merged
            .into_iter()
            .filter_map(|(key, entry)| match entry {
                PartialEntry::Value(value) => Some((key, value)),
                PartialEntry::Tombstone { .. } => None,
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, key: &[u8]) -> Option<ValueReference> {
        self.entries.get(key).map(|entry| *entry.value())
    }

    pub fn put(&self, key: Vec<u8>, value: ValueReference) -> Option<ValueReference> {
        self.entries.insert(key, value)
    }

    pub fn remove(&self, key: &[u8]) -> Option<ValueReference> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applies `record`, just appended to `segment`, to the keydir.
    ///
    /// Tombstones remove the key, any other record points the key at its value.
    pub fn update(&self, record: &Record, segment: &LogSegment) -> Result<()> {
        if record.is_tombstone() {
            self.entries.remove(record.key.as_slice());
        } else {
            let value = ValueReference::of_appended(record, segment)?;
            self.entries.insert(record.key.clone(), value);
        }
        Ok(())
    }

    /// Points the key at the copy of `record` just appended to `segment`, unless the
    /// keydir already holds a newer value or no longer holds the key.
    ///
    /// The comparison and the update happen under the key's shard lock, so a concurrent
    /// `put` of the same key is never overwritten with the older copy.
    pub fn relocate(&self, record: &Record, segment: &LogSegment) -> Result<bool> {
        let value = ValueReference::of_appended(record, segment)?;
        match self.entries.get_mut(record.key.as_slice()) {
            Some(mut current) if current.timestamp <= record.header.timestamp => {
                *current = value;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Removes the key if its value has expired at `now`.
    pub fn remove_if_expired(&self, key: &[u8], now: u64) -> bool {
        self.entries
            .remove_if(key, |_, value| value.is_expired(now))
            .is_some()
    }

    /// Snapshot of the timestamp of every key, used to decide which records are stale.
    pub fn timestamps(&self) -> HashMap<Vec<u8>, u64> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().timestamp))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(segment_id: u64, timestamp: u64) -> ValueReference {
        ValueReference {
            segment_id,
            offset: 0,
            value_size: 1,
            ttl: 0,
            timestamp,
        }
    }

    #[test]
    fn test_merge_later_segment_wins() {
        let mut first = PartialKeyDir::new(false);
        first.insert(b"a".to_vec(), PartialEntry::Value(value(0, 0)));
        first.insert(b"b".to_vec(), PartialEntry::Value(value(0, 0)));

        let mut second = PartialKeyDir::new(false);
        second.insert(b"a".to_vec(), PartialEntry::Value(value(1, 0)));
        second.insert(b"b".to_vec(), PartialEntry::Tombstone { timestamp: 0 });

        // Order of the input does not matter, segment numbers do.
        let keydir = KeyDir::merge(vec![(1, second), (0, first)]);
        assert_eq!(keydir.len(), 1);
        assert_eq!(keydir.get(b"a").unwrap().segment_id, 1);
        assert!(!keydir.contains_key(b"b"));
    }

    #[test]
    fn test_merge_later_segment_wins_over_newer_timestamp() {
        let mut first = PartialKeyDir::new(false);
        first.insert(b"a".to_vec(), PartialEntry::Value(value(0, 100)));

        let mut second = PartialKeyDir::new(false);
        second.insert(b"a".to_vec(), PartialEntry::Value(value(1, 50)));

        let keydir = KeyDir::merge(vec![(0, first), (1, second)]);
        assert_eq!(keydir.get(b"a").unwrap().segment_id, 1);
    }

    #[test]
    fn test_merge_compacted_segment_keeps_newer_timestamp() {
        let mut active = PartialKeyDir::new(false);
        active.insert(b"a".to_vec(), PartialEntry::Value(value(3, 200)));
        active.insert(b"b".to_vec(), PartialEntry::Value(value(3, 50)));
        active.insert(b"c".to_vec(), PartialEntry::Value(value(3, 70)));

        let mut compacted = PartialKeyDir::new(true);
        compacted.insert(b"a".to_vec(), PartialEntry::Value(value(4, 100)));
        compacted.insert(b"b".to_vec(), PartialEntry::Value(value(4, 60)));
        compacted.insert(b"c".to_vec(), PartialEntry::Tombstone { timestamp: 60 });

        let keydir = KeyDir::merge(vec![(3, active), (4, compacted)]);
        assert_eq!(keydir.get(b"a").unwrap().segment_id, 3);
        assert_eq!(keydir.get(b"b").unwrap().segment_id, 4);
        assert_eq!(keydir.get(b"c").unwrap().segment_id, 3);
    }

    #[test]
    fn test_partial_keydir_tracks_every_timestamp() {
        let mut partial = PartialKeyDir::new(false);
        partial.insert(b"a".to_vec(), PartialEntry::Value(value(0, 10)));
        partial.insert(b"a".to_vec(), PartialEntry::Tombstone { timestamp: 30 });
        partial.insert(b"b".to_vec(), PartialEntry::Value(value(0, 20)));

        assert_eq!(partial.len(), 2);
        assert_eq!(partial.max_timestamp, 30);
    }

    #[test]
    fn test_remove_if_expired() {
        let keydir = KeyDir::new();
        keydir.put(
            b"a".to_vec(),
            ValueReference {
                ttl: 10,
                ..value(0, 1)
            },
        );
        keydir.put(b"b".to_vec(), value(0, 1));

        assert!(!keydir.remove_if_expired(b"a", 10));
        assert!(keydir.remove_if_expired(b"a", 11));
        assert!(!keydir.remove_if_expired(b"b", u64::MAX));
        assert_eq!(keydir.len(), 1);
    }

    #[test]
    fn test_update_and_relocate() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let segment = LogSegment::open(temp.path().join("00000000000000000000.log"), false)?;
        let keydir = KeyDir::new();

        let record = Record::new(b"k".to_vec(), b"value".to_vec(), 5, 0);
        segment.append(&record)?;
        keydir.update(&record, &segment)?;

        let reference = keydir.get(b"k").unwrap();
        assert_eq!(reference.offset, (record.size() - 5) as u64);
        assert_eq!(segment.read(reference.offset, reference.value_size)?, b"value");

        // An older copy never replaces the newer value.
        let older = Record::new(b"k".to_vec(), b"old".to_vec(), 4, 0);
        segment.append(&older)?;
        assert!(!keydir.relocate(&older, &segment)?);
        assert_eq!(keydir.get(b"k").unwrap(), reference);

        // A copy with the same timestamp does.
        segment.append(&record)?;
        assert!(keydir.relocate(&record, &segment)?);
        assert_ne!(keydir.get(b"k").unwrap(), reference);

        // Relocation never resurrects a key.
        let other = Record::new(b"gone".to_vec(), b"v".to_vec(), 5, 0);
        segment.append(&other)?;
        assert!(!keydir.relocate(&other, &segment)?);
        assert!(!keydir.contains_key(b"gone"));

        let tombstone = Record::tombstone(b"k".to_vec(), 6);
        segment.append(&tombstone)?;
        keydir.update(&tombstone, &segment)?;
        assert!(keydir.is_empty());
        Ok(())
    }
}
