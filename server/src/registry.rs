//! Process-wide matchmaking state: the waiting pool, every live race
//! session, and the racer-id -> race index. All of it lives behind a single
//! lock owned by the service; every method here runs to completion inside
//! one critical section, so match formation, ranking and the timeout sweep
//! never interleave.

use crate::events::{EventBus, RaceEvent};
use crate::pool::{Entry, WaitingPool};
use crate::race::{RaceSession, RaceStatus};
use log::{debug, info};
use rand::Rng;
use shared::{circuit_name, lap_count, qualifier_time_secs, EntryRecord, ResultRecord,
    NET_CIRCUIT_COUNT};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A race fills up at 16 entrants.
pub const MAX_RACERS: usize = 16;
/// Below a full field, a race forms once 2 entries have waited this long.
pub const SMALL_POOL_WAIT: Duration = Duration::from_secs(90);
/// Grace added to the qualifying time limit before the sweep gives up.
const QUALIFYING_TOLERANCE: Duration = Duration::from_secs(60);
/// Grace added to the expected race duration.
const FINAL_TOLERANCE: Duration = Duration::from_secs(180);
/// How long a finished race stays queryable.
const FINISHED_RETENTION: Duration = Duration::from_secs(5 * 60);
/// Racer ids stay below this bound.
const MAX_RACER_ID: u32 = 10_000_000;

/// A final that timed out and needs a default result loaded for the circuit
/// before it can be closed out.
#[derive(Debug, PartialEq, Eq)]
pub struct PendingDefault {
    pub race: u64,
    pub circuit: u8,
}

pub struct Netplay {
    pub pool: WaitingPool,
    races: HashMap<u64, RaceSession>,
    race_by_racer: HashMap<u32, u64>,
    next_race_key: u64,
    pub sweeper_running: bool,
    bus: EventBus,
}

impl Netplay {
    pub fn new(bus: EventBus) -> Self {
        Self {
            pool: WaitingPool::new(),
            races: HashMap::new(),
            race_by_racer: HashMap::new(),
            next_race_key: 1,
            sweeper_running: false,
            bus,
        }
    }

    /// Mints a racer id that collides with nothing currently live.
    fn make_id(&self) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let id = rng.gen_range(0..MAX_RACER_ID);
            if !self.pool.contains(id) && !self.race_by_racer.contains_key(&id) {
                return id;
            }
        }
    }

    /// Registers a new entry: sweeps the pool, inserts, notifies the
    /// waiting list, and attempts match formation. Returns the racer id.
    pub fn add_entry(&mut self, record: EntryRecord, now: Instant) -> u32 {
        let entry = Entry::new(self.make_id(), record, now);
        let id = entry.id;
        info!(
            "New entry {} circuit {}",
            entry.display_name(),
            circuit_name(entry.circuit)
        );
        let player = entry.display_name();
        let circuit = circuit_name(entry.circuit).to_string();
        self.pool.add(entry, now);
        let event = RaceEvent::PlayerWaiting {
            player,
            circuit,
            waiting: self.pool.display_names(),
        };
        let _ = self.bus.send(event);
        self.try_start_race(now);
        id
    }

    /// Poll from a waiting racer: refreshes its idle timer and reports the
    /// pool size, after giving match formation a chance to run.
    pub fn touch(&mut self, id: u32, now: Instant) -> Option<usize> {
        let count = self.pool.touch(id, now);
        if count.is_some() {
            self.try_start_race(now);
        }
        count
    }

    /// Race lookup by any of its racers. A poll from a pool-resident racer
    /// is also an opportunity to form a match, so that is attempted first.
    pub fn find_race(&mut self, id: u32, now: Instant) -> Option<&mut RaceSession> {
        if !self.race_by_racer.contains_key(&id) && self.pool.contains(id) {
            self.try_start_race(now);
        }
        let key = *self.race_by_racer.get(&id)?;
        self.races.get_mut(&key)
    }

    pub fn race_count(&self) -> usize {
        self.races.len()
    }

    /// Everyone currently waiting or in an unfinished race.
    pub fn player_count(&self) -> usize {
        self.pool.len()
            + self
                .races
                .values()
                .filter(|race| !race.is_race_done())
                .map(RaceSession::entry_count)
                .sum::<usize>()
    }

    pub fn is_idle(&self) -> bool {
        self.pool.is_empty() && self.races.is_empty()
    }

    /// Forms a race if the pool allows it: a full field of the 16 oldest
    /// entries, or the whole pool once 2 entries have waited 90 seconds.
    fn try_start_race(&mut self, now: Instant) {
        if self.pool.len() <= 1 {
            return;
        }
        let mut candidates: Vec<(u32, Instant)> =
            self.pool.iter().map(|e| (e.id, e.created)).collect();
        candidates.sort_by_key(|&(id, created)| (created, id));
        let selected: Vec<u32> = if candidates.len() >= MAX_RACERS {
            candidates[..MAX_RACERS].iter().map(|&(id, _)| id).collect()
        } else {
            let waited_long = candidates
                .iter()
                .filter(|&&(_, created)| now.duration_since(created) > SMALL_POOL_WAIT)
                .count();
            if waited_long < 2 {
                return;
            }
            candidates.iter().map(|&(id, _)| id).collect()
        };

        let racers: Vec<Entry> = selected
            .iter()
            .filter_map(|&id| self.pool.remove(id))
            .collect();

        // Plurality vote on the circuit; ties go to the lowest index.
        let mut votes = [0usize; NET_CIRCUIT_COUNT as usize];
        for entry in &racers {
            votes[entry.circuit as usize] += 1;
        }
        let mut circuit = 0u8;
        let mut max_votes = 0;
        for (i, &count) in votes.iter().enumerate() {
            if count > max_votes {
                max_votes = count;
                circuit = i as u8;
            }
        }
        let weather = racers[0].weather;

        let key = self.next_race_key;
        self.next_race_key += 1;
        let mut race = RaceSession::new(key, circuit, weather, now);
        let mut names = Vec::with_capacity(racers.len());
        for entry in racers {
            names.push(entry.display_name());
            race.set_entry(entry.id, entry.record);
            self.race_by_racer.insert(entry.id, key);
        }
        race.set_status(RaceStatus::Qualifying, &self.bus, now);
        info!(
            "Race start: {} with {} racers, weather {}",
            race.circuit_name(),
            race.entry_count(),
            weather
        );
        let event = RaceEvent::RaceStarted {
            circuit: race.circuit_name().to_string(),
            racers: {
                names.sort();
                names
            },
        };
        self.races.insert(key, race);
        let _ = self.bus.send(event);
    }

    /// Removes one racer from its race and the index.
    fn drop_racer(&mut self, key: u64, id: u32) {
        if let Some(race) = self.races.get_mut(&key) {
            race.remove_entry(id);
        }
        self.race_by_racer.remove(&id);
    }

    /// Evicts a whole session.
    fn evict_race(&mut self, key: u64) {
        if let Some(race) = self.races.remove(&key) {
            info!(
                "Race {} state {:?} timed out",
                race.circuit_name(),
                race.status
            );
            for id in race.entry_ids() {
                self.race_by_racer.remove(&id);
            }
        }
    }

    fn phase_budget(race: &RaceSession) -> Option<Duration> {
        match race.status {
            RaceStatus::Qualifying => Some(
                Duration::from_secs(qualifier_time_secs(race.circuit)) + QUALIFYING_TOLERANCE,
            ),
            RaceStatus::Final => Some(
                Duration::from_secs(
                    qualifier_time_secs(race.circuit) * lap_count(race.circuit) as u64,
                ) + FINAL_TOLERANCE,
            ),
            RaceStatus::Finished => Some(FINISHED_RETENTION),
            RaceStatus::Init => None,
        }
    }

    /// One pass of the periodic sweep: expires idle pool entries, handles
    /// every race session past its phase budget, and returns the finals
    /// that need a default result blob before they can be closed.
    pub fn sweep(&mut self, now: Instant) -> Vec<PendingDefault> {
        let mut expired: Vec<u64> = self
            .races
            .values()
            .filter(|race| match Self::phase_budget(race) {
                Some(budget) => now.duration_since(race.phase_started) > budget,
                None => false,
            })
            .map(|race| race.key)
            .collect();
        expired.sort_unstable();

        let mut pending = Vec::new();
        for key in expired {
            let race = &self.races[&key];
            match race.status {
                RaceStatus::Qualifying if race.entry_count() >= 3 => {
                    // Drop the stragglers; the race survives if at least
                    // two racers posted a time.
                    let stragglers: Vec<u32> = race
                        .entry_ids()
                        .into_iter()
                        .filter(|&id| race.qualifier(id).is_none())
                        .collect();
                    for id in stragglers {
                        info!(
                            "Race {} qualifier {} has timed out",
                            self.races[&key].circuit_name(),
                            self.races[&key].entry_name(id)
                        );
                        self.drop_racer(key, id);
                    }
                    if self.races[&key].entry_count() < 2 {
                        self.evict_race(key);
                    }
                }
                RaceStatus::Final => pending.push(PendingDefault {
                    race: key,
                    circuit: race.circuit,
                }),
                _ => self.evict_race(key),
            }
        }
        self.pool.sweep_idle(now);
        debug!(
            "sweep: {} races, {} players",
            self.race_count(),
            self.player_count()
        );
        pending
    }

    /// Closes out a timed-out final: every qualified racer without a result
    /// gets the default blob and the race finishes. Without a usable blob
    /// (load failed) or anyone to substitute for, the session is evicted.
    pub fn finish_with_defaults(&mut self, key: u64, blob: Option<Vec<u8>>, now: Instant) {
        let Some(race) = self.races.get_mut(&key) else {
            return;
        };
        if race.status != RaceStatus::Final {
            // a straggler's result arrived in the meantime and finished it
            return;
        }
        let missing: Vec<u32> = race
            .entry_ids()
            .into_iter()
            .filter(|&id| race.has_qualified(id) && race.result(id).is_none())
            .collect();
        let default = blob.and_then(|b| ResultRecord::from_bytes(&b));
        match default {
            Some(default) if !missing.is_empty() => {
                for id in missing {
                    info!(
                        "Race {} driver {} has timed out",
                        race.circuit_name(),
                        race.entry_name(id)
                    );
                    race.set_result(id, default.clone());
                }
                let bus = self.bus.clone();
                self.races
                    .get_mut(&key)
                    .expect("race present")
                    .set_status(RaceStatus::Finished, &bus, now);
            }
            _ => self.evict_race(key),
        }
    }

    #[cfg(test)]
    pub fn race_mut(&mut self, key: u64) -> Option<&mut RaceSession> {
        self.races.get_mut(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;
    use shared::QualifierRecord;

    fn record_with(circuit: u8, weather: u8) -> EntryRecord {
        let mut data = [0u8; 128];
        data[108] = circuit;
        data[116] = weather;
        EntryRecord::from_bytes(&data).unwrap()
    }

    fn qualifier(frames: u32) -> QualifierRecord {
        let mut raw = [0u8; 8];
        raw[0..4].copy_from_slice(&frames.to_le_bytes());
        QualifierRecord::from_bytes(&raw).unwrap()
    }

    fn default_blob(seconds: u32) -> Vec<u8> {
        let mut raw = vec![0u8; 20];
        raw[12..16].copy_from_slice(&seconds.to_le_bytes());
        raw
    }

    #[test]
    fn no_race_below_two_entries() {
        let (bus, _rx) = event_channel();
        let now = Instant::now();
        let mut net = Netplay::new(bus);
        let id = net.add_entry(record_with(0, 0), now);
        assert!(net.find_race(id, now).is_none());
        assert_eq!(net.race_count(), 0);
    }

    #[test]
    fn small_pool_waits_ninety_seconds() {
        let (bus, _rx) = event_channel();
        let now = Instant::now();
        let mut net = Netplay::new(bus);
        let a = net.add_entry(record_with(2, 5), now);
        let b = net.add_entry(record_with(2, 9), now);
        let c = net.add_entry(record_with(2, 1), now);
        assert_eq!(net.race_count(), 0);

        // only one entry is old enough: still no race
        net.pool.get_mut(a).unwrap().created = now - Duration::from_secs(91);
        net.touch(b, now);
        assert_eq!(net.race_count(), 0);

        // two old entries: the whole pool races
        net.pool.get_mut(b).unwrap().created = now - Duration::from_secs(92);
        net.touch(c, now);
        assert_eq!(net.race_count(), 1);
        let race = net.find_race(c, now).unwrap();
        assert_eq!(race.entry_count(), 3);
        assert_eq!(race.status, RaceStatus::Qualifying);
        // weather comes from the oldest entry (b is older than a)
        assert_eq!(race.weather, 9);
    }

    #[test]
    fn full_pool_races_the_sixteen_oldest() {
        let (bus, _rx) = event_channel();
        let now = Instant::now();
        let mut net = Netplay::new(bus);
        let mut ids = Vec::new();
        // seed the pool directly so formation only runs on the poll below
        for i in 0..18u64 {
            let id = i as u32 + 1;
            let mut entry = Entry::new(id, record_with(0, 0), now);
            // spread creation over 5 minutes, oldest first
            entry.created = now - Duration::from_secs(300 - i * 10);
            net.pool.add(entry, now);
            ids.push(id);
        }
        net.touch(ids[17], now);

        assert_eq!(net.race_count(), 1);
        // the two youngest keep waiting
        assert_eq!(net.pool.len(), 2);
        assert!(net.pool.contains(ids[16]));
        assert!(net.pool.contains(ids[17]));
        let race = net.find_race(ids[0], now).unwrap();
        assert_eq!(race.entry_count(), MAX_RACERS);
    }

    #[test]
    fn circuit_vote_tie_goes_to_lowest_index() {
        let (bus, _rx) = event_channel();
        let now = Instant::now();
        let mut net = Netplay::new(bus);
        let a = net.add_entry(record_with(1, 0), now);
        let b = net.add_entry(record_with(0, 0), now);
        let c = net.add_entry(record_with(1, 0), now);
        let d = net.add_entry(record_with(0, 0), now);
        for id in [a, b, c, d] {
            net.pool.get_mut(id).unwrap().created = now - Duration::from_secs(120);
        }
        net.touch(a, now);

        let race = net.find_race(a, now).unwrap();
        assert_eq!(race.circuit, 0);
    }

    #[test]
    fn matched_racers_leave_the_pool() {
        let (bus, _rx) = event_channel();
        let now = Instant::now();
        let mut net = Netplay::new(bus);
        let a = net.add_entry(record_with(0, 0), now);
        let b = net.add_entry(record_with(0, 0), now);
        for id in [a, b] {
            net.pool.get_mut(id).unwrap().created = now - Duration::from_secs(120);
        }
        net.touch(a, now);

        assert!(net.pool.is_empty());
        assert!(net.find_race(a, now).is_some());
        assert!(net.find_race(b, now).is_some());
        assert_eq!(net.touch(a, now), None);
    }

    fn start_race(net: &mut Netplay, now: Instant, racers: usize) -> (u64, Vec<u32>) {
        let mut ids = Vec::new();
        for _ in 0..racers {
            let id = net.add_entry(record_with(0, 0), now);
            net.pool.get_mut(id).unwrap().created = now - Duration::from_secs(120);
            ids.push(id);
        }
        net.touch(ids[0], now);
        let key = net.find_race(ids[0], now).unwrap().key;
        (key, ids)
    }

    #[test]
    fn sweep_drops_qualifying_stragglers() {
        let (bus, _rx) = event_channel();
        let now = Instant::now();
        let mut net = Netplay::new(bus);
        let (key, ids) = start_race(&mut net, now, 3);
        for &id in &ids[..2] {
            net.find_race(id, now).unwrap().set_qualifier(id, qualifier(100));
        }

        // circuit 0 budget is 64s + 60s tolerance
        net.race_mut(key).unwrap().phase_started = now - Duration::from_secs(125);
        let pending = net.sweep(now);

        assert!(pending.is_empty());
        let race = net.race_mut(key).unwrap();
        assert_eq!(race.entry_count(), 2);
        assert_eq!(race.status, RaceStatus::Qualifying);
        assert!(net.find_race(ids[2], now).is_none());
    }

    #[test]
    fn sweep_evicts_qualifying_that_cannot_be_salvaged() {
        let (bus, _rx) = event_channel();
        let now = Instant::now();
        let mut net = Netplay::new(bus);
        let (key, ids) = start_race(&mut net, now, 3);
        net.find_race(ids[0], now)
            .unwrap()
            .set_qualifier(ids[0], qualifier(100));

        net.race_mut(key).unwrap().phase_started = now - Duration::from_secs(125);
        net.sweep(now);

        assert_eq!(net.race_count(), 0);
        assert!(net.is_idle());
    }

    #[test]
    fn sweep_requests_defaults_for_timed_out_final() {
        let (bus, _rx) = event_channel();
        let now = Instant::now();
        let mut net = Netplay::new(bus);
        let (key, ids) = start_race(&mut net, now, 2);
        for &id in &ids {
            net.find_race(id, now).unwrap().set_qualifier(id, qualifier(100));
        }
        let bus2 = net.bus.clone();
        net.race_mut(key)
            .unwrap()
            .set_status(RaceStatus::Final, &bus2, now);

        // circuit 0 final budget: 64 * 3 + 180 = 372s
        net.race_mut(key).unwrap().phase_started = now - Duration::from_secs(373);
        let pending = net.sweep(now);
        assert_eq!(pending, vec![PendingDefault { race: key, circuit: 0 }]);

        net.finish_with_defaults(key, Some(default_blob(600)), now);
        let race = net.race_mut(key).unwrap();
        assert_eq!(race.status, RaceStatus::Finished);
        for &id in &ids {
            assert!(race.result(id).is_some());
        }
    }

    #[test]
    fn final_without_default_blob_is_evicted() {
        let (bus, _rx) = event_channel();
        let now = Instant::now();
        let mut net = Netplay::new(bus);
        let (key, ids) = start_race(&mut net, now, 2);
        for &id in &ids {
            net.find_race(id, now).unwrap().set_qualifier(id, qualifier(100));
        }
        let bus2 = net.bus.clone();
        net.race_mut(key)
            .unwrap()
            .set_status(RaceStatus::Final, &bus2, now);
        net.race_mut(key).unwrap().phase_started = now - Duration::from_secs(373);
        net.sweep(now);

        net.finish_with_defaults(key, None, now);
        assert_eq!(net.race_count(), 0);
    }

    #[test]
    fn finished_race_is_retained_then_evicted() {
        let (bus, _rx) = event_channel();
        let now = Instant::now();
        let mut net = Netplay::new(bus);
        let (key, ids) = start_race(&mut net, now, 2);
        let bus2 = net.bus.clone();
        let race = net.race_mut(key).unwrap();
        race.set_status(RaceStatus::Final, &bus2, now);
        race.set_status(RaceStatus::Finished, &bus2, now);

        // inside the 5 minute retention window
        net.race_mut(key).unwrap().phase_started = now - Duration::from_secs(299);
        net.sweep(now);
        assert!(net.find_race(ids[0], now).is_some());

        net.race_mut(key).unwrap().phase_started = now - Duration::from_secs(301);
        net.sweep(now);
        assert!(net.find_race(ids[0], now).is_none());
        assert!(net.is_idle());
    }

    #[test]
    fn racer_ids_stay_below_bound() {
        let (bus, _rx) = event_channel();
        let now = Instant::now();
        let mut net = Netplay::new(bus);
        for _ in 0..50 {
            let id = net.add_entry(record_with(0, 0), now);
            assert!(id < MAX_RACER_ID);
            net.pool.remove(id);
        }
    }
}
