//! Fire-and-forget side effects of race state transitions.
//!
//! Handlers and the sweep never wait on persistence or notifications: they
//! push a `RaceEvent` onto an unbounded channel and move on. A dedicated
//! sink task drains the channel and drives the injected collaborators. The
//! sink also owns the mapping from in-memory race keys to persisted ids, so
//! the in-memory state machine never sees storage identifiers at all.
//! Collaborator failures are logged and swallowed; they cannot affect a
//! transition that has already happened.

use log::{error, info};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Summary of a race persisted when qualifying closes.
#[derive(Debug, Clone, Serialize)]
pub struct RaceSummary {
    pub circuit: u8,
    pub weather: u8,
    pub started_at: SystemTime,
}

/// One ranked qualifying attempt, with the raw entry+qualifier audit blob.
#[derive(Debug, Clone, Serialize)]
pub struct QualifierReport {
    pub racer_id: u32,
    pub name: String,
    pub country: String,
    pub car_number: u8,
    pub car_color: u8,
    pub intermediate: bool,
    pub elapsed_ms: Option<u32>,
    pub rank: u8,
    #[serde(skip)]
    pub blob: Vec<u8>,
}

/// One ranked final result.
#[derive(Debug, Clone, Serialize)]
pub struct ResultReport {
    pub racer_id: u32,
    pub elapsed_ms: Option<u32>,
    pub rank: u8,
}

#[derive(Debug)]
pub enum RaceEvent {
    PlayerWaiting {
        player: String,
        circuit: String,
        waiting: Vec<String>,
    },
    RaceStarted {
        circuit: String,
        racers: Vec<String>,
    },
    /// Qualifying closed: persist the race and every ranked attempt.
    QualifyingClosed {
        race: u64,
        summary: RaceSummary,
        qualifiers: Vec<QualifierReport>,
    },
    /// A raw result blob arrived and should be archived.
    ResultReceived {
        race: u64,
        racer_id: u32,
        name: String,
        blob: Vec<u8>,
    },
    /// The race finished: persist the final standings.
    RaceFinished {
        race: u64,
        results: Vec<ResultReport>,
    },
}

/// Sending half handed to everything that can trigger side effects.
pub type EventBus = mpsc::UnboundedSender<RaceEvent>;

pub fn event_channel() -> (EventBus, mpsc::UnboundedReceiver<RaceEvent>) {
    mpsc::unbounded_channel()
}

/// Durable store for races, qualifying records and results.
pub trait Storage: Send + Sync {
    fn save_race(&self, race: &RaceSummary) -> io::Result<u64>;
    fn save_qualifier(&self, race_id: u64, report: &QualifierReport) -> io::Result<u64>;
    fn save_result(&self, record_id: u64, elapsed_ms: Option<u32>, rank: u8) -> io::Result<()>;
    fn save_result_blob(&self, race_id: u64, racer_id: u32, name: &str, blob: &[u8])
        -> io::Result<()>;
}

/// Outbound chat-style notifications about matchmaking activity.
pub trait Notifier: Send + Sync {
    fn player_waiting(&self, player: &str, circuit: &str, waiting: &[String]);
    fn race_start(&self, circuit: &str, racers: &[String]);
}

/// Source of the canned result substituted for racers that drop out of a
/// final, keyed by circuit.
pub trait DefaultResults: Send + Sync {
    fn load(&self, circuit: u8) -> io::Result<Vec<u8>>;
}

/// Notifier that only writes log lines. Used when no outbound channel is
/// configured.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn player_waiting(&self, player: &str, circuit: &str, waiting: &[String]) {
        info!(
            "{} is waiting for racers on {} ({} in list)",
            player,
            circuit,
            waiting.len()
        );
    }

    fn race_start(&self, circuit: &str, racers: &[String]) {
        info!("{}: race start with {}", circuit, racers.join(", "));
    }
}

struct PersistedRace {
    race_id: u64,
    record_ids: HashMap<u32, u64>,
}

/// Spawns the sink task draining `rx` into the collaborators. The task ends
/// when every `EventBus` clone has been dropped.
pub fn spawn_event_sink(
    mut rx: mpsc::UnboundedReceiver<RaceEvent>,
    storage: Arc<dyn Storage>,
    notifier: Arc<dyn Notifier>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut persisted: HashMap<u64, PersistedRace> = HashMap::new();
        while let Some(event) = rx.recv().await {
            handle_event(event, &mut persisted, storage.as_ref(), notifier.as_ref());
        }
    })
}

fn handle_event(
    event: RaceEvent,
    persisted: &mut HashMap<u64, PersistedRace>,
    storage: &dyn Storage,
    notifier: &dyn Notifier,
) {
    match event {
        RaceEvent::PlayerWaiting {
            player,
            circuit,
            waiting,
        } => notifier.player_waiting(&player, &circuit, &waiting),
        RaceEvent::RaceStarted { circuit, racers } => notifier.race_start(&circuit, &racers),
        RaceEvent::QualifyingClosed {
            race,
            summary,
            qualifiers,
        } => {
            let race_id = match storage.save_race(&summary) {
                Ok(id) => id,
                Err(err) => {
                    error!("Saving race failed: {}", err);
                    return;
                }
            };
            let mut record_ids = HashMap::new();
            for report in &qualifiers {
                match storage.save_qualifier(race_id, report) {
                    Ok(record_id) => {
                        record_ids.insert(report.racer_id, record_id);
                    }
                    Err(err) => error!("Saving qualifier failed: {}", err),
                }
            }
            persisted.insert(race, PersistedRace { race_id, record_ids });
        }
        RaceEvent::ResultReceived {
            race,
            racer_id,
            name,
            blob,
        } => {
            if let Some(p) = persisted.get(&race) {
                if let Err(err) = storage.save_result_blob(p.race_id, racer_id, &name, &blob) {
                    error!("Saving result failed: {}", err);
                }
            }
        }
        RaceEvent::RaceFinished { race, results } => {
            let Some(p) = persisted.remove(&race) else {
                // qualifying was never persisted, nothing to attach to
                return;
            };
            for report in results {
                if let Some(&record_id) = p.record_ids.get(&report.racer_id) {
                    if let Err(err) =
                        storage.save_result(record_id, report.elapsed_ms, report.rank)
                    {
                        error!("Saving race result failed: {}", err);
                    }
                }
            }
        }
    }
}
