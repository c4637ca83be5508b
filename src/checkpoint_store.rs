//! Append-only checkpoint store
//!
//! Length-prefixed bincode records on disk. Appends never rewrite
//! existing bytes; loading scans forward and keeps the last record that
//! decodes, so a torn tail from a crash is ignored rather than fatal.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionCheckpoint {
    pub id: String,
    pub last_slot: u64,
    pub circuit_state: String,
    pub subscriptions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AggregateMetrics {
    pub trades_processed: u64,
    pub decode_errors: u64,
    pub parse_failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub created_at_ms: i64,
    pub connections: Vec<ConnectionCheckpoint>,
    pub aggregate: AggregateMetrics,
}

pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Append one checkpoint record
    pub fn append(&self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let encoded = bincode::serialize(checkpoint).context("encode checkpoint")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open checkpoint store {:?}", self.path))?;
        file.write_all(&(encoded.len() as u32).to_le_bytes())?;
        file.write_all(&encoded)?;
        file.flush()?;
        debug!("💾 Checkpoint appended ({} bytes)", encoded.len());
        Ok(())
    }

    /// Latest record that decodes cleanly; `None` on a missing or empty
    /// store
    pub fn load_latest(&self) -> Result<Option<Checkpoint>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        let mut latest = None;
        let mut offset = 0usize;
        while offset + 4 <= buffer.len() {
            let len =
                u32::from_le_bytes(buffer[offset..offset + 4].try_into().expect("4 bytes"))
                    as usize;
            let start = offset + 4;
            let end = start + len;
            if end > buffer.len() {
                warn!("💾 Truncated checkpoint tail ignored at offset {}", offset);
                break;
            }
            match bincode::deserialize::<Checkpoint>(&buffer[start..end]) {
                Ok(checkpoint) => latest = Some(checkpoint),
                Err(e) => {
                    warn!("💾 Undecodable checkpoint at offset {}: {}", offset, e);
                }
            }
            offset = end;
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(slot: u64) -> Checkpoint {
        Checkpoint {
            created_at_ms: 1_700_000_000_000 + slot as i64,
            connections: vec![ConnectionCheckpoint {
                id: "conn-1".to_string(),
                last_slot: slot,
                circuit_state: "healthy".to_string(),
                subscriptions: vec!["prog1".to_string()],
            }],
            aggregate: AggregateMetrics::default(),
        }
    }

    #[test]
    fn test_append_and_load_latest() {
        let dir = std::env::temp_dir().join(format!("ckpt-test-{}", std::process::id()));
        let path = dir.join("checkpoints.bin");
        let _ = std::fs::remove_file(&path);
        let store = CheckpointStore::new(&path);

        assert!(store.load_latest().unwrap().is_none());

        store.append(&sample(100)).unwrap();
        store.append(&sample(200)).unwrap();
        store.append(&sample(300)).unwrap();

        let latest = store.load_latest().unwrap().unwrap();
        assert_eq!(latest.connections[0].last_slot, 300);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let dir = std::env::temp_dir().join(format!("ckpt-torn-{}", std::process::id()));
        let path = dir.join("checkpoints.bin");
        let _ = std::fs::remove_file(&path);
        let store = CheckpointStore::new(&path);

        store.append(&sample(100)).unwrap();
        // Simulate a crash mid-append
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&999u32.to_le_bytes()).unwrap();
            file.write_all(&[1, 2, 3]).unwrap();
        }

        let latest = store.load_latest().unwrap().unwrap();
        assert_eq!(latest.connections[0].last_slot, 100);

        let _ = std::fs::remove_file(&path);
    }
}
