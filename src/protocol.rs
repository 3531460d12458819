//! Request/response envelopes exchanged with the engine worker.
//!
//! Every request carries a caller-chosen correlation `id` that is echoed on its response, so
//! replies can be matched even when they arrive out of submission order.

use serde::{Deserialize, Serialize};

use crate::cancel::CancelReason;
use crate::engine::{BestAction, EditMode, EngineState, Evaluation, MoveSuggestion};
use crate::error::{EngineError, Rejection};
use crate::history::HistoryView;
use crate::mcts::MctsConfig;
use crate::snapshot::Snapshot;

/// Which evaluator backs a freshly initialised engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnginePreference {
    #[default]
    Heuristic,
    Uniform,
    /// Host-supplied evaluator (e.g. a neural network bound through JavaScript).
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Command {
    #[serde(rename_all = "camelCase")]
    Init {
        #[serde(default)]
        preference: EnginePreference,
        #[serde(default)]
        config: Option<MctsConfig>,
    },
    SyncSnapshot {
        snapshot: Snapshot,
    },
    ExportSnapshot,
    CalculateEvaluation,
    CancelEvaluation,
    ListMovesWithAdv {
        limit: usize,
        #[serde(default)]
        depth: u32,
    },
    GuessBestAction,
    GetHistorySnapshot,
    GetHistoryLength,
    JumpToMoveIndex {
        index: usize,
    },
    EditCell {
        row: usize,
        col: usize,
        mode: EditMode,
    },
    #[serde(rename_all = "camelCase")]
    ChangeDifficulty {
        num_simulations: u32,
    },
    Place {
        row: usize,
        col: usize,
    },
    ApplyMove {
        action: usize,
    },
    Undo,
    Redo,
}

impl Command {
    /// Commands that run a search and therefore take part in single-flight cancellation.
    pub fn is_evaluation(&self) -> bool {
        matches!(
            self,
            Command::CalculateEvaluation
                | Command::GuessBestAction
                | Command::ListMovesWithAdv { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Init { .. } => "init",
            Command::SyncSnapshot { .. } => "syncSnapshot",
            Command::ExportSnapshot => "exportSnapshot",
            Command::CalculateEvaluation => "calculateEvaluation",
            Command::CancelEvaluation => "cancelEvaluation",
            Command::ListMovesWithAdv { .. } => "listMovesWithAdv",
            Command::GuessBestAction => "guessBestAction",
            Command::GetHistorySnapshot => "getHistorySnapshot",
            Command::GetHistoryLength => "getHistoryLength",
            Command::JumpToMoveIndex { .. } => "jumpToMoveIndex",
            Command::EditCell { .. } => "editCell",
            Command::ChangeDifficulty { .. } => "changeDifficulty",
            Command::Place { .. } => "place",
            Command::ApplyMove { .. } => "applyMove",
            Command::Undo => "undo",
            Command::Redo => "redo",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum Reply {
    Initialized(EngineState),
    State(EngineState),
    Snapshot(Snapshot),
    Evaluation(Evaluation),
    BestAction(BestAction),
    Moves(Vec<MoveSuggestion>),
    /// A cancelled evaluation whose reason is not an error for the caller.
    Cancelled {
        reason: CancelReason,
    },
    History(Vec<HistoryView>),
    HistoryLength(usize),
    Jumped {
        state: EngineState,
        snapshot: Snapshot,
    },
    Ack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    IllegalAction,
    WrongPhase,
    AlreadyTerminal,
    NothingToUndo,
    NothingToRedo,
    MoveIndexOutOfRange,
    SearchInFlight,
    InvalidEdit,
    NotInitialized,
    EvaluationCancelled,
    InvalidSnapshot,
    InvalidConfig,
    PredictorFailed,
    /// Transport failure: a message that could not be decoded or encoded.
    ChannelError,
    Internal,
}

impl From<&Rejection> for ErrorCode {
    fn from(rejection: &Rejection) -> Self {
        match rejection {
            Rejection::IllegalAction { .. } => ErrorCode::IllegalAction,
            Rejection::WrongPhase { .. } => ErrorCode::WrongPhase,
            Rejection::AlreadyTerminal => ErrorCode::AlreadyTerminal,
            Rejection::NothingToUndo => ErrorCode::NothingToUndo,
            Rejection::NothingToRedo => ErrorCode::NothingToRedo,
            Rejection::MoveIndexOutOfRange { .. } => ErrorCode::MoveIndexOutOfRange,
            Rejection::SearchInFlight => ErrorCode::SearchInFlight,
            Rejection::InvalidEdit { .. } => ErrorCode::InvalidEdit,
        }
    }
}

impl From<&EngineError> for ErrorCode {
    fn from(error: &EngineError) -> Self {
        match error {
            EngineError::Rejected(rejection) => rejection.into(),
            EngineError::Board(_) => ErrorCode::IllegalAction,
            EngineError::Predictor(_) => ErrorCode::PredictorFailed,
            EngineError::InvalidSnapshot(_) => ErrorCode::InvalidSnapshot,
            EngineError::InvalidConfig(_) => ErrorCode::InvalidConfig,
            EngineError::NotInitialized => ErrorCode::NotInitialized,
            EngineError::MissingRoot => ErrorCode::Internal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: ErrorCode,
    pub message: String,
    /// Structured rejection, present when the request was refused by the state machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl From<EngineError> for ResponseError {
    fn from(error: EngineError) -> Self {
        let rejection = match &error {
            EngineError::Rejected(rejection) => Some(rejection.clone()),
            _ => None,
        };
        Self {
            code: (&error).into(),
            message: error.to_string(),
            rejection,
        }
    }
}

impl From<Rejection> for ResponseError {
    fn from(rejection: Rejection) -> Self {
        EngineError::Rejected(rejection).into()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Reply>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn ok(id: u64, reply: Reply) -> Self {
        Self {
            id,
            success: true,
            result: Some(reply),
            error: None,
        }
    }

    pub fn err(id: u64, error: impl Into<ResponseError>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Response for an evaluation that stopped early. Only an engine replacement is a failure.
    pub fn cancelled(id: u64, reason: CancelReason) -> Self {
        if reason.is_error_for_caller() {
            Self::err(
                id,
                ResponseError {
                    code: ErrorCode::EvaluationCancelled,
                    message: format!("evaluation cancelled: {reason:?}"),
                    rejection: None,
                },
            )
        } else {
            Self::ok(id, Reply::Cancelled { reason })
        }
    }
}
