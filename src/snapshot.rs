use std::collections::BTreeMap;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::board::{worker_owner, BoardState, DOME, NUM_PLAYERS};
use crate::codec::{ACTION_SIZE, BOARD_SIZE};
use crate::error::EngineError;
use crate::history::HistoryEntry;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Serializable position plus move log, sufficient to resume a game in a later session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u32,
    pub player: usize,
    pub board: BoardState,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub future: Vec<HistoryEntry>,
    #[serde(default)]
    pub game_ended: [i8; NUM_PLAYERS],
    /// Legal-action mask as 0/1 bytes. Informational on import; the engine recomputes it.
    #[serde(default)]
    pub valid_moves: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl Snapshot {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(EngineError::InvalidSnapshot(format!(
                "unsupported version {} (expected {SNAPSHOT_VERSION})",
                self.version
            )));
        }
        if self.player >= NUM_PLAYERS {
            return Err(EngineError::InvalidSnapshot(format!("bad player {}", self.player)));
        }
        if !self.valid_moves.is_empty() && self.valid_moves.len() != ACTION_SIZE {
            return Err(EngineError::InvalidSnapshot(format!(
                "validMoves has {} entries",
                self.valid_moves.len()
            )));
        }
        validate_board(&self.board)?;
        for entry in self.history.iter().chain(self.future.iter()) {
            if entry.player >= NUM_PLAYERS {
                return Err(EngineError::InvalidSnapshot(format!(
                    "history entry for player {}",
                    entry.player
                )));
            }
            if entry.action.is_some_and(|action| action >= ACTION_SIZE) {
                return Err(EngineError::InvalidSnapshot("history action out of range".into()));
            }
            validate_board(&entry.board_before)?;
        }
        Ok(())
    }
}

fn validate_board(board: &BoardState) -> Result<(), EngineError> {
    let mut seen = [false; 4];
    for row in 0..BOARD_SIZE {
        for col in 0..BOARD_SIZE {
            let height = board.height(row, col);
            if !(0..=DOME).contains(&height) {
                return Err(EngineError::InvalidSnapshot(format!(
                    "height {height} at ({row}, {col})"
                )));
            }
            let occupant = board.occupant(row, col);
            if occupant == 0 {
                continue;
            }
            if worker_owner(occupant).is_none() {
                return Err(EngineError::InvalidSnapshot(format!("unknown worker {occupant}")));
            }
            let slot = match occupant {
                1 => 0,
                2 => 1,
                -1 => 2,
                _ => 3,
            };
            if std::mem::replace(&mut seen[slot], true) {
                return Err(EngineError::InvalidSnapshot(format!(
                    "worker {occupant} appears twice"
                )));
            }
            if height >= DOME {
                return Err(EngineError::InvalidSnapshot(format!(
                    "worker {occupant} stands on a dome"
                )));
            }
        }
    }
    Ok(())
}

/// Persistence seam for saved games, keyed by namespace (e.g. "practice", "match:<id>").
pub trait SnapshotStore {
    fn read_snapshot(&self, namespace: &str) -> Result<Option<Snapshot>, EngineError>;
    fn write_snapshot(&mut self, namespace: &str, snapshot: &Snapshot) -> Result<(), EngineError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: HashMap<String, Snapshot>,
}

impl SnapshotStore for MemoryStore {
    fn read_snapshot(&self, namespace: &str) -> Result<Option<Snapshot>, EngineError> {
        Ok(self.snapshots.get(namespace).cloned())
    }

    fn write_snapshot(&mut self, namespace: &str, snapshot: &Snapshot) -> Result<(), EngineError> {
        snapshot.validate()?;
        self.snapshots.insert(namespace.to_string(), snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::tests::opened_board;

    fn snapshot() -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            player: 0,
            board: opened_board(),
            history: Vec::new(),
            future: Vec::new(),
            game_ended: [0, 0],
            valid_moves: Vec::new(),
            metadata: None,
        }
    }

    #[test]
    fn store_keeps_namespaces_apart() {
        let mut store = MemoryStore::default();
        assert_eq!(store.read_snapshot("practice").expect("read"), None);

        let mut saved = snapshot();
        saved.metadata = Some(BTreeMap::from([("opponent".to_string(), "heuristic".to_string())]));
        store.write_snapshot("practice", &saved).expect("write");
        assert_eq!(store.read_snapshot("practice").expect("read"), Some(saved));
        assert_eq!(store.read_snapshot("match:1").expect("read"), None);
    }

    #[test]
    fn store_refuses_corrupt_snapshots() {
        let mut store = MemoryStore::default();
        let mut corrupt = snapshot();
        corrupt.valid_moves = vec![1; 10];
        assert!(matches!(
            store.write_snapshot("practice", &corrupt),
            Err(EngineError::InvalidSnapshot(_))
        ));
        assert_eq!(store.read_snapshot("practice").expect("read"), None);
    }

    #[test]
    fn board_checks_catch_bad_tensors() {
        let mut domed = snapshot();
        domed.board.set_height(2, 2, 5);
        assert!(domed.validate().is_err());

        let mut bytes = opened_board().as_bytes();
        // Second copy of worker 1 on C3 (cell 12, worker channel first).
        bytes[12 * 3] = 1;
        let duplicated = BoardState::from_bytes(&bytes).expect("length is fine");
        let mut doubled = snapshot();
        doubled.board = duplicated;
        assert!(doubled.validate().is_err());
    }

    #[test]
    fn camel_case_json_with_defaults() {
        let json = serde_json::to_value(snapshot()).expect("serialises");
        assert!(json.get("gameEnded").is_some());
        assert!(json.get("metadata").is_none());

        let mut minimal = json.clone();
        let object = minimal.as_object_mut().expect("object");
        object.remove("history");
        object.remove("future");
        object.remove("validMoves");
        let parsed: Snapshot = serde_json::from_value(minimal).expect("defaults fill in");
        assert_eq!(parsed, snapshot());
    }
}
