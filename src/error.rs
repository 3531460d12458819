use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::board::{BoardError, Phase};
use crate::predictor::PredictorError;

/// Typed refusal of a state-machine transition. A rejected call never mutates state.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum Rejection {
    #[error("action {action} is not legal in the current position")]
    IllegalAction { action: usize },
    #[error("operation not allowed during the {current:?} phase")]
    WrongPhase { current: Phase },
    #[error("the game is already over")]
    AlreadyTerminal,
    #[error("no move to undo")]
    NothingToUndo,
    #[error("no move to redo")]
    NothingToRedo,
    #[error("move index {index} is outside 0..={len}")]
    MoveIndexOutOfRange { index: usize, len: usize },
    #[error("position cannot be edited while a search is in flight")]
    SearchInFlight,
    #[error("invalid edit: {detail}")]
    InvalidEdit { detail: String },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error("board error: {0}")]
    Board(#[from] BoardError),
    #[error("predictor error: {0}")]
    Predictor(#[from] PredictorError),
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("engine not initialised")]
    NotInitialized,
    #[error("root node missing after simulations")]
    MissingRoot,
}
