//! File-backed implementations of the persistence collaborators: races and
//! ranked records land as JSON lines under a per-race directory, raw client
//! blobs next to them, and the per-circuit default result blobs come from a
//! ghost directory.

use crate::events::{DefaultResults, QualifierReport, RaceSummary, Storage};
use log::debug;
use serde::Serialize;
use shared::circuit_name;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Serialize)]
struct ResultRow {
    record_id: u64,
    elapsed_ms: Option<u32>,
    rank: u8,
}

#[derive(Serialize)]
struct QualifierRow<'a> {
    record_id: u64,
    #[serde(flatten)]
    report: &'a QualifierReport,
}

/// Persists races under `<root>/<race id>_<circuit>/`: a `race.json`
/// summary, one JSON line per qualifier and result, and the raw binary
/// blobs the consoles uploaded.
pub struct FileStore {
    root: PathBuf,
    next_race_id: AtomicU64,
    next_record_id: AtomicU64,
    // record id -> (race dir, racer id), needed to route save_result
    records: Mutex<HashMap<u64, (PathBuf, u32)>>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            next_race_id: AtomicU64::new(1),
            next_record_id: AtomicU64::new(1),
            records: Mutex::new(HashMap::new()),
        }
    }

    fn race_dir(&self, race_id: u64, circuit: u8) -> PathBuf {
        self.root.join(format!(
            "{:06}_{}",
            race_id,
            circuit_name(circuit).replace(' ', "_")
        ))
    }

    fn append_line(path: &Path, value: &impl Serialize) -> io::Result<()> {
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        serde_json::to_writer(&mut file, value)?;
        file.write_all(b"\n")
    }
}

fn file_safe(name: &str) -> String {
    name.replace([' ', '/'], "_")
}

impl Storage for FileStore {
    fn save_race(&self, race: &RaceSummary) -> io::Result<u64> {
        let race_id = self.next_race_id.fetch_add(1, Ordering::Relaxed);
        let dir = self.race_dir(race_id, race.circuit);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("race.json"), serde_json::to_vec_pretty(race)?)?;
        debug!("Race saved to {}", dir.display());
        Ok(race_id)
    }

    fn save_qualifier(&self, race_id: u64, report: &QualifierReport) -> io::Result<u64> {
        let record_id = self.next_record_id.fetch_add(1, Ordering::Relaxed);
        // the race dir name embeds the circuit, so find it by prefix
        let dir = self.find_race_dir(race_id)?;
        Self::append_line(
            &dir.join("qualifiers.jsonl"),
            &QualifierRow { record_id, report },
        )?;
        let blob_name = format!("{:x}_{}_qualif.bin", report.racer_id, file_safe(&report.name));
        fs::write(dir.join(blob_name), &report.blob)?;
        self.records
            .lock()
            .expect("store index poisoned")
            .insert(record_id, (dir, report.racer_id));
        Ok(record_id)
    }

    fn save_result(&self, record_id: u64, elapsed_ms: Option<u32>, rank: u8) -> io::Result<()> {
        let dir = {
            let records = self.records.lock().expect("store index poisoned");
            let (dir, _) = records
                .get(&record_id)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown record id"))?;
            dir.clone()
        };
        Self::append_line(
            &dir.join("results.jsonl"),
            &ResultRow {
                record_id,
                elapsed_ms,
                rank,
            },
        )
    }

    fn save_result_blob(
        &self,
        race_id: u64,
        racer_id: u32,
        name: &str,
        blob: &[u8],
    ) -> io::Result<()> {
        let dir = self.find_race_dir(race_id)?;
        let path = dir.join(format!("{:x}_{}.bin", racer_id, file_safe(name)));
        fs::write(&path, blob)?;
        debug!("Result saved to {}", path.display());
        Ok(())
    }
}

impl FileStore {
    fn find_race_dir(&self, race_id: u64) -> io::Result<PathBuf> {
        let prefix = format!("{:06}_", race_id);
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(&prefix)
            {
                return Ok(entry.path());
            }
        }
        Err(io::Error::new(io::ErrorKind::NotFound, "unknown race id"))
    }
}

/// Default/DNF result blobs, one per circuit, named `<CIRCUIT NAME>_1.bin`.
pub struct GhostDir {
    dir: PathBuf,
}

impl GhostDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl DefaultResults for GhostDir {
    fn load(&self, circuit: u8) -> io::Result<Vec<u8>> {
        fs::read(self.dir.join(format!("{}_1.bin", circuit_name(circuit))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn temp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "netplay-store-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn report(racer_id: u32, rank: u8) -> QualifierReport {
        QualifierReport {
            racer_id,
            name: "SPEED RACER".to_string(),
            country: "JP".to_string(),
            car_number: 3,
            car_color: 1,
            intermediate: false,
            elapsed_ms: Some(91_234),
            rank,
            blob: vec![0xab; 136],
        }
    }

    #[test]
    fn race_round_trip_on_disk() {
        let root = temp_root("roundtrip");
        let store = FileStore::new(&root);

        let race_id = store
            .save_race(&RaceSummary {
                circuit: 2,
                weather: 1,
                started_at: SystemTime::now(),
            })
            .unwrap();
        let record_id = store.save_qualifier(race_id, &report(0x2a, 1)).unwrap();
        store.save_result(record_id, Some(185_000), 1).unwrap();
        store
            .save_result_blob(race_id, 0x2a, "SPEED RACER (JP)", &[1, 2, 3])
            .unwrap();

        let dir = root.join("000001_SUZUKA");
        assert!(dir.join("race.json").exists());
        assert!(dir.join("qualifiers.jsonl").exists());
        assert!(dir.join("results.jsonl").exists());
        assert_eq!(fs::read(dir.join("2a_SPEED_RACER_qualif.bin")).unwrap().len(), 136);
        assert_eq!(
            fs::read(dir.join("2a_SPEED_RACER_(JP).bin")).unwrap(),
            vec![1, 2, 3]
        );

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn unknown_record_id_is_an_error() {
        let root = temp_root("unknown");
        let store = FileStore::new(&root);
        assert!(store.save_result(999, None, 1).is_err());
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn ghost_dir_loads_by_circuit_name() {
        let root = temp_root("ghost");
        fs::write(root.join("MOTEGI_1.bin"), [7u8; 20]).unwrap();
        let ghosts = GhostDir::new(&root);

        assert_eq!(ghosts.load(1).unwrap(), vec![7u8; 20]);
        assert!(ghosts.load(0).is_err());

        let _ = fs::remove_dir_all(&root);
    }
}
