//! One matched race's lifecycle: entries, qualifying attempts, the ranking
//! computed when qualifying closes, and final results.
//!
//! The state machine only moves forward (Init -> Qualifying -> Final ->
//! Finished). Entering Final ranks every entrant by qualifying time and
//! emits the persistence events; entering Finished ranks the submitted
//! results. Both transitions are synchronous in memory; everything durable
//! happens behind the event bus.

use crate::events::{EventBus, QualifierReport, RaceEvent, RaceSummary, ResultReport};
use log::error;
use shared::{circuit_name, EntryRecord, QualifierRecord, ResultRecord};
use std::collections::HashMap;
use std::time::{Instant, SystemTime};

/// Only the top 8 qualifiers advance to the final.
pub const FINALIST_COUNT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RaceStatus {
    Init,
    Qualifying,
    Final,
    Finished,
}

pub struct RaceSession {
    pub key: u64,
    pub circuit: u8,
    pub weather: u8,
    pub status: RaceStatus,
    pub phase_started: Instant,
    pub started_at: SystemTime,
    entries: HashMap<u32, EntryRecord>,
    qualifiers: HashMap<u32, QualifierRecord>,
    qualified_rank: HashMap<u32, u8>,
    results: HashMap<u32, ResultRecord>,
}

impl RaceSession {
    pub fn new(key: u64, circuit: u8, weather: u8, now: Instant) -> Self {
        Self {
            key,
            circuit,
            weather,
            status: RaceStatus::Init,
            phase_started: now,
            started_at: SystemTime::now(),
            entries: HashMap::new(),
            qualifiers: HashMap::new(),
            qualified_rank: HashMap::new(),
            results: HashMap::new(),
        }
    }

    pub fn circuit_name(&self) -> &'static str {
        circuit_name(self.circuit)
    }

    pub fn set_entry(&mut self, id: u32, record: EntryRecord) {
        self.entries.insert(id, record);
    }

    pub fn remove_entry(&mut self, id: u32) {
        self.entries.remove(&id);
        self.qualifiers.remove(&id);
        self.results.remove(&id);
    }

    pub fn entry(&self, id: u32) -> Option<&EntryRecord> {
        self.entries.get(&id)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Entrant ids in ascending order, for deterministic iteration.
    pub fn entry_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn entry_name(&self, id: u32) -> String {
        self.entries
            .get(&id)
            .map(EntryRecord::display_name)
            .unwrap_or_else(|| "Unknown".to_string())
    }

    pub fn set_qualifier(&mut self, id: u32, record: QualifierRecord) {
        self.qualifiers.insert(id, record);
    }

    pub fn qualifier(&self, id: u32) -> Option<&QualifierRecord> {
        self.qualifiers.get(&id)
    }

    /// True once every entrant has submitted a qualifying attempt.
    pub fn is_qualifying_done(&self) -> bool {
        self.entries.len() == self.qualifiers.len()
    }

    /// 1-based qualifying rank, computed once at the Final transition.
    pub fn rank(&self, id: u32) -> Option<u8> {
        self.qualified_rank.get(&id).copied()
    }

    pub fn has_qualified(&self, id: u32) -> bool {
        self.rank(id).map_or(false, |r| r as usize <= FINALIST_COUNT)
    }

    pub fn set_result(&mut self, id: u32, record: ResultRecord) {
        self.results.insert(id, record);
    }

    pub fn result(&self, id: u32) -> Option<&ResultRecord> {
        self.results.get(&id)
    }

    /// The race is over once every entrant has a result, or once the field
    /// of finalists is complete.
    pub fn is_race_done(&self) -> bool {
        self.entries.len() == self.results.len() || self.results.len() == FINALIST_COUNT
    }

    /// Advances the state machine. Equal or backward states are ignored.
    /// Entering Final computes the qualifying ranking and persists it;
    /// entering Finished persists the final standings.
    pub fn set_status(&mut self, status: RaceStatus, bus: &EventBus, now: Instant) {
        if status <= self.status {
            return;
        }
        self.status = status;
        self.phase_started = now;
        match status {
            RaceStatus::Final => self.close_qualifying(bus),
            RaceStatus::Finished => self.close_race(bus),
            _ => {}
        }
    }

    fn close_qualifying(&mut self, bus: &EventBus) {
        // Rank every entrant by qualifying time, DNF last. An entrant with
        // no submission at all sorts after any DNF.
        let mut ids = self.entry_ids();
        ids.sort_by(|&a, &b| {
            let ka = self.qualifier_sort_key(a);
            let kb = self.qualifier_sort_key(b);
            ka.0.cmp(&kb.0).then(ka.1.total_cmp(&kb.1))
        });
        for (i, &id) in ids.iter().enumerate() {
            self.qualified_rank.insert(id, (i + 1) as u8);
        }

        let mut qualifiers = Vec::new();
        for &id in &ids {
            let (Some(entry), Some(qualifier)) = (self.entries.get(&id), self.qualifiers.get(&id))
            else {
                continue;
            };
            let mut blob = entry.as_bytes().to_vec();
            blob.extend_from_slice(qualifier.as_bytes());
            qualifiers.push(QualifierReport {
                racer_id: id,
                name: entry.name(),
                country: entry.country(),
                car_number: entry.car_number(),
                car_color: entry.car_color(),
                intermediate: entry.intermediate(),
                elapsed_ms: qualifier.elapsed_ms(),
                rank: self.qualified_rank[&id],
                blob,
            });
        }
        let event = RaceEvent::QualifyingClosed {
            race: self.key,
            summary: RaceSummary {
                circuit: self.circuit,
                weather: self.weather,
                started_at: self.started_at,
            },
            qualifiers,
        };
        if bus.send(event).is_err() {
            error!("Event sink is gone, dropping qualifying results");
        }
    }

    fn close_race(&mut self, bus: &EventBus) {
        let mut ids: Vec<u32> = self.results.keys().copied().collect();
        ids.sort_unstable();
        ids.sort_by_key(|id| self.results[id].sort_ms());
        let results = ids
            .iter()
            .enumerate()
            .map(|(i, &id)| ResultReport {
                racer_id: id,
                elapsed_ms: self.results[&id].elapsed_ms(),
                rank: (i + 1) as u8,
            })
            .collect();
        let event = RaceEvent::RaceFinished {
            race: self.key,
            results,
        };
        if bus.send(event).is_err() {
            error!("Event sink is gone, dropping race results");
        }
    }

    fn qualifier_sort_key(&self, id: u32) -> (u32, f32) {
        match self.qualifiers.get(&id) {
            Some(q) => (q.frames(), q.frac()),
            None => (u32::MAX, 0.0),
        }
    }
}
