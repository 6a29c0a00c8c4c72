//! Protocol handlers for the three poll endpoints. Each handler decodes the
//! raw request body, runs one short critical section against the shared
//! matchmaking state, and encodes the binary response frame. Anything
//! malformed gets the single generic error byte; the console cannot
//! interpret finer-grained failures.

use crate::events::{DefaultResults, EventBus, RaceEvent};
use crate::race::RaceStatus;
use crate::registry::Netplay;
use log::{debug, error, info, warn};
use shared::{error_frame, success_frame, EntryRecord, QualifierRecord, ResultRecord};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};

/// Sweep cadence while any racer or race is live.
const SWEEP_PERIOD: Duration = Duration::from_secs(15);

const ENTRY_ENDPOINT: &str = "/cgi-bin/f355/network_play/entry.cgi";
const ELIMINATION_ENDPOINT: &str = "/cgi-bin/f355/network_play/elimination.cgi";
const FINAL_ENDPOINT: &str = "/cgi-bin/f355/network_play/final.cgi";

/// The netplay service: shared state plus the injected collaborators the
/// sweep needs. Cheap to clone into connection tasks.
#[derive(Clone)]
pub struct NetplayService {
    state: Arc<Mutex<Netplay>>,
    bus: EventBus,
    defaults: Arc<dyn DefaultResults>,
}

impl NetplayService {
    pub fn new(bus: EventBus, defaults: Arc<dyn DefaultResults>) -> Self {
        Self {
            state: Arc::new(Mutex::new(Netplay::new(bus.clone()))),
            bus,
            defaults,
        }
    }

    /// Shared state handle; tests use it to rewind timers.
    pub fn state(&self) -> &Arc<Mutex<Netplay>> {
        &self.state
    }

    /// Routes a request body to its endpoint. `None` means unknown path.
    pub async fn handle(&self, path: &str, body: &[u8]) -> Option<Vec<u8>> {
        debug!("data[{}] url {}", body.len(), path);
        match path {
            ENTRY_ENDPOINT => Some(self.entry(body).await),
            ELIMINATION_ENDPOINT => Some(self.elimination(body).await),
            FINAL_ENDPOINT => Some(self.final_race(body).await),
            _ => None,
        }
    }

    /// entry.cgi: registration (byte 0 == 0) or waiting-room poll.
    pub async fn entry(&self, body: &[u8]) -> Vec<u8> {
        if body.is_empty() {
            return error_frame();
        }
        if body[0] == 0 {
            let Some(record) = body.get(3..3 + shared::ENTRY_RECORD_LEN).and_then(EntryRecord::from_bytes)
            else {
                warn!("entry[0] short body ({} bytes)", body.len());
                return error_frame();
            };
            let now = Instant::now();
            let id = {
                let mut state = self.state.lock().await;
                state.add_entry(record, now)
            };
            self.ensure_sweeper();
            let mut payload = [0u8; 8];
            payload[0..4].copy_from_slice(&id.to_le_bytes());
            payload[4..8].copy_from_slice(&id.to_le_bytes());
            success_frame(&payload)
        } else {
            let Some(id) = read_u32(body, 3) else {
                return error_frame();
            };
            let now = Instant::now();
            let mut state = self.state.lock().await;
            if let Some(race) = state.find_race(id, now) {
                info!(
                    "entry[1] race started: {} for racer {}",
                    race.circuit_name(),
                    race.entry_name(id)
                );
                let mut payload = [0u8; 16];
                payload[0] = 1;
                payload[4] = race.entry_count() as u8;
                payload[8] = race.circuit;
                payload[12] = race.weather;
                return success_frame(&payload);
            }
            match state.touch(id, now) {
                None => {
                    warn!("entry[1] not found: {}", id);
                    error_frame()
                }
                Some(count) => {
                    if let Some(entry) = state.pool.get(id) {
                        info!("entry[1]: {} waiting...", entry.display_name());
                    }
                    let mut payload = [0u8; 16];
                    payload[4] = count as u8;
                    success_frame(&payload)
                }
            }
        }
    }

    /// elimination.cgi: qualifier submission, opponent fetch, status poll.
    pub async fn elimination(&self, body: &[u8]) -> Vec<u8> {
        if body.is_empty() {
            return error_frame();
        }
        let now = Instant::now();
        if body[0] == 0 {
            // Record qualifier time
            let Some(id) = read_u32(body, 3) else {
                return error_frame();
            };
            let Some(qualifier) = body
                .get(11..11 + shared::QUALIFIER_RECORD_LEN)
                .and_then(QualifierRecord::from_bytes)
            else {
                warn!("elimination[0] short body ({} bytes)", body.len());
                return error_frame();
            };
            let mut state = self.state.lock().await;
            let Some(race) = state.find_race(id, now) else {
                warn!("elimination[0] No race found for {}", id);
                // Don't report an error just yet
                return success_frame(&[]);
            };
            if race.status != RaceStatus::Qualifying {
                warn!(
                    "elimination[0] Race {} already started (for {})",
                    race.circuit_name(),
                    race.entry_name(id)
                );
                return error_frame();
            }
            info!(
                "Race {} qualifier received for {}: {}",
                race.circuit_name(),
                race.entry_name(id),
                qualifier.format_time()
            );
            race.set_qualifier(id, qualifier);
            success_frame(&[])
        } else {
            let Some(other) = read_u32(body, 7) else {
                return error_frame();
            };
            if other != 0 {
                self.fetch_opponent_qualifier(body, other, now).await
            } else {
                self.qualifier_status(body, now).await
            }
        }
    }

    async fn fetch_opponent_qualifier(&self, body: &[u8], other: u32, now: Instant) -> Vec<u8> {
        let mut state = self.state.lock().await;
        let Some(race) = state.find_race(other, now) else {
            warn!("elimination[1, opponent] No race found for {}", other);
            return error_frame();
        };
        let (Some(entry), Some(qualifier)) = (race.entry(other), race.qualifier(other)) else {
            warn!("elimination[1, opponent] Entry/qualifier not found for {}", other);
            return error_frame();
        };
        let mut payload = [0u8; 136];
        payload[..128].copy_from_slice(entry.as_bytes());
        payload[128..].copy_from_slice(qualifier.as_bytes());
        if let Some(dest) = read_u32(body, 3) {
            info!(
                "Race {}: {} qualifier sent to {}",
                race.circuit_name(),
                race.entry_name(other),
                race.entry_name(dest)
            );
        }
        success_frame(&payload)
    }

    async fn qualifier_status(&self, body: &[u8], now: Instant) -> Vec<u8> {
        let Some(id) = read_u32(body, 3) else {
            return error_frame();
        };
        let mut payload = [0u8; 72];
        let mut state = self.state.lock().await;
        let Some(race) = state.find_race(id, now) else {
            warn!("elimination[1, 0] No race found for {}", id);
            // Race cancelled: all other drivers retired
            payload[0] = 1;
            return success_frame(&payload);
        };
        let done = race.is_qualifying_done();
        payload[0] = done as u8;
        payload[4..8].copy_from_slice(&body[3..7]);
        let mut offset = 12;
        for rid in race.entry_ids() {
            if rid != id && race.qualifier(rid).is_some() {
                payload[offset..offset + 4].copy_from_slice(&rid.to_le_bytes());
                offset += 4;
            }
        }
        info!(
            "Race {} queried by {}: status {}",
            race.circuit_name(),
            race.entry_name(id),
            payload[0]
        );
        if done {
            let bus = self.bus.clone();
            race.set_status(RaceStatus::Final, &bus, now);
        }
        success_frame(&payload)
    }

    /// final.cgi: result submission, opponent fetch, status poll.
    pub async fn final_race(&self, body: &[u8]) -> Vec<u8> {
        if body.is_empty() {
            return error_frame();
        }
        let now = Instant::now();
        match body[0] {
            0 => {
                // Receive race results
                let Some(id) = read_u32(body, 3) else {
                    return error_frame();
                };
                let Some(result) = body.get(11..).and_then(ResultRecord::from_bytes) else {
                    warn!("final[0] short body ({} bytes)", body.len());
                    return error_frame();
                };
                let mut state = self.state.lock().await;
                let Some(race) = state.find_race(id, now) else {
                    info!("final[0] No race found for {}", id);
                    // Don't report an error just yet
                    return success_frame(&[]);
                };
                if race.status != RaceStatus::Final {
                    warn!(
                        "final[0] Race {} already finished (for {})",
                        race.circuit_name(),
                        race.entry_name(id)
                    );
                    return error_frame();
                }
                if !race.has_qualified(id) {
                    error!(
                        "final[0] Race {} results received but {} didn't qualify",
                        race.circuit_name(),
                        race.entry_name(id)
                    );
                    return error_frame();
                }
                info!(
                    "Race {} result received for {}",
                    race.circuit_name(),
                    race.entry_name(id)
                );
                let audit = RaceEvent::ResultReceived {
                    race: race.key,
                    racer_id: id,
                    name: race.entry_name(id),
                    blob: result.as_bytes().to_vec(),
                };
                race.set_result(id, result);
                let done = race.is_race_done();
                if done {
                    let bus = self.bus.clone();
                    race.set_status(RaceStatus::Finished, &bus, now);
                }
                let _ = self.bus.send(audit);
                success_frame(&[])
            }
            1 => {
                let Some(other) = read_u32(body, 7) else {
                    return error_frame();
                };
                if other != 0 {
                    self.fetch_opponent_result(body, other, now).await
                } else {
                    self.result_status(body, now).await
                }
            }
            _ => error_frame(),
        }
    }

    async fn fetch_opponent_result(&self, body: &[u8], other: u32, now: Instant) -> Vec<u8> {
        let mut state = self.state.lock().await;
        let Some(race) = state.find_race(other, now) else {
            warn!("final[1, opponent] No race found for {}", other);
            return error_frame();
        };
        let Some(result) = race.result(other) else {
            warn!("final[1, opponent] No result found for {}", other);
            return error_frame();
        };
        let payload = result.as_bytes().to_vec();
        if let Some(dest) = read_u32(body, 3) {
            info!(
                "Race {}: {} result sent to {}",
                race.circuit_name(),
                race.entry_name(other),
                race.entry_name(dest)
            );
        }
        success_frame(&payload)
    }

    async fn result_status(&self, body: &[u8], now: Instant) -> Vec<u8> {
        let Some(id) = read_u32(body, 3) else {
            return error_frame();
        };
        let mut payload = [0u8; 36];
        let mut state = self.state.lock().await;
        let Some(race) = state.find_race(id, now) else {
            warn!("final[1, 0] No race found for {}", id);
            // Race cancelled: all other drivers retired
            payload[0] = 1;
            return success_frame(&payload);
        };
        payload[0] = race.is_race_done() as u8;
        payload[4..8].copy_from_slice(&body[3..7]);
        // at most 7 opponent ids fit in the fixed-size payload; a
        // non-qualified entrant can see all 8 finalists finish
        let mut offset = 8;
        for rid in race.entry_ids() {
            if offset + 4 > payload.len() {
                break;
            }
            if rid != id && race.has_qualified(rid) && race.result(rid).is_some() {
                payload[offset..offset + 4].copy_from_slice(&rid.to_le_bytes());
                offset += 4;
            }
        }
        info!(
            "Race {} final queried by {}: status {}",
            race.circuit_name(),
            race.entry_name(id),
            payload[0]
        );
        success_frame(&payload)
    }

    /// Starts the periodic sweep if it is not already running. The task
    /// stops itself once the pool and the registry are both empty and is
    /// restarted lazily by the next registration.
    pub fn ensure_sweeper(&self) {
        let service = self.clone();
        tokio::spawn(async move {
            {
                let mut state = service.state.lock().await;
                if state.sweeper_running {
                    return;
                }
                state.sweeper_running = true;
            }
            debug!("sweep timer started");
            let mut ticker = interval(SWEEP_PERIOD);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                service.sweep_once().await;
                let mut state = service.state.lock().await;
                if state.is_idle() {
                    state.sweeper_running = false;
                    debug!("sweep timer stopped");
                    return;
                }
            }
        });
    }

    /// One sweep pass: expire sessions, then close out timed-out finals
    /// with the per-circuit default result. The default blob is loaded
    /// outside the lock.
    pub async fn sweep_once(&self) {
        let pending = {
            let mut state = self.state.lock().await;
            state.sweep(Instant::now())
        };
        for item in pending {
            let blob = match self.defaults.load(item.circuit) {
                Ok(blob) => Some(blob),
                Err(err) => {
                    error!(
                        "Can't load default result for track {}: {}",
                        shared::circuit_name(item.circuit),
                        err
                    );
                    None
                }
            };
            let mut state = self.state.lock().await;
            state.finish_with_defaults(item.race, blob, Instant::now());
        }
    }
}

fn read_u32(body: &[u8], offset: usize) -> Option<u32> {
    let bytes = body.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
