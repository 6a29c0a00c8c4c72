//! Waiting pool: racers that have registered but are not yet matched into
//! a race. Members are aged out when their console stops polling.

use log::info;
use shared::EntryRecord;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A waiting entry is dropped if its console has not polled for this long.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(20);

/// One racer's pending registration, carrying the raw client record plus
/// the fields decoded out of it at registration time.
#[derive(Debug, Clone)]
pub struct Entry {
    pub id: u32,
    pub record: EntryRecord,
    pub circuit: u8,
    pub intermediate: bool,
    pub weather: u8,
    pub car_number: u8,
    pub car_color: u8,
    pub created: Instant,
    pub last_seen: Instant,
}

impl Entry {
    pub fn new(id: u32, record: EntryRecord, now: Instant) -> Self {
        Self {
            id,
            circuit: record.circuit(),
            intermediate: record.intermediate(),
            weather: record.weather(),
            car_number: record.car_number(),
            car_color: record.car_color(),
            record,
            created: now,
            last_seen: now,
        }
    }

    pub fn display_name(&self) -> String {
        self.record.display_name()
    }
}

/// Racer-id keyed pool of entries waiting for a match. Insertion order is
/// irrelevant; match selection orders by `created`.
#[derive(Default)]
pub struct WaitingPool {
    entries: HashMap<u32, Entry>,
}

impl WaitingPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts after sweeping idle members first.
    pub fn add(&mut self, entry: Entry, now: Instant) {
        self.sweep_idle(now);
        self.entries.insert(entry.id, entry);
    }

    /// Marks the entry as alive and returns the current pool size, or
    /// `None` if the id is unknown (expired or never registered).
    pub fn touch(&mut self, id: u32, now: Instant) -> Option<usize> {
        self.sweep_idle(now);
        let entry = self.entries.get_mut(&id)?;
        entry.last_seen = now;
        Some(self.entries.len())
    }

    /// Drops every entry whose console has gone quiet for `IDLE_TIMEOUT`.
    pub fn sweep_idle(&mut self, now: Instant) {
        self.entries.retain(|id, entry| {
            let alive = now.duration_since(entry.last_seen) <= IDLE_TIMEOUT;
            if !alive {
                info!("Entry {} has timed out", id);
            }
            alive
        });
    }

    pub fn get(&self, id: u32) -> Option<&Entry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Entry> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<Entry> {
        self.entries.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    /// Display names of everyone currently waiting, sorted for stable
    /// notification output.
    pub fn display_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.values().map(Entry::display_name).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> EntryRecord {
        EntryRecord::from_bytes(&[0u8; 128]).unwrap()
    }

    #[test]
    fn add_and_touch() {
        let now = Instant::now();
        let mut pool = WaitingPool::new();
        pool.add(Entry::new(7, record(), now), now);

        assert_eq!(pool.touch(7, now), Some(1));
        assert_eq!(pool.touch(8, now), None);
    }

    #[test]
    fn idle_entries_are_swept() {
        let now = Instant::now();
        let mut pool = WaitingPool::new();
        pool.add(Entry::new(1, record(), now), now);
        pool.add(Entry::new(2, record(), now), now);

        // entry 1 last polled 21s ago, entry 2 at 19s
        pool.get_mut(1).unwrap().last_seen = now - Duration::from_secs(21);
        pool.get_mut(2).unwrap().last_seen = now - Duration::from_secs(19);
        pool.sweep_idle(now);

        assert!(!pool.contains(1));
        assert!(pool.contains(2));
    }

    #[test]
    fn touch_sweeps_first() {
        let now = Instant::now();
        let mut pool = WaitingPool::new();
        pool.add(Entry::new(1, record(), now), now);
        pool.add(Entry::new(2, record(), now), now);
        pool.get_mut(2).unwrap().last_seen = now - Duration::from_secs(30);

        // the stale entry must not count towards the reported pool size
        assert_eq!(pool.touch(1, now), Some(1));
    }

    #[test]
    fn touch_of_expired_entry_is_not_found() {
        let now = Instant::now();
        let mut pool = WaitingPool::new();
        pool.add(Entry::new(1, record(), now), now);
        pool.get_mut(1).unwrap().last_seen = now - Duration::from_secs(30);

        assert_eq!(pool.touch(1, now), None);
    }

    #[test]
    fn sorted_display_names() {
        let now = Instant::now();
        let mut pool = WaitingPool::new();
        let mut data = [0u8; 128];
        data[92] = b'B';
        data[105] = b'J';
        data[106] = b'P';
        pool.add(
            Entry::new(1, EntryRecord::from_bytes(&data).unwrap(), now),
            now,
        );
        data[92] = b'A';
        pool.add(
            Entry::new(2, EntryRecord::from_bytes(&data).unwrap(), now),
            now,
        );

        assert_eq!(pool.display_names(), vec!["A (JP)", "B (JP)"]);
    }
}
