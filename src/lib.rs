#![deny(clippy::unwrap_used)]
//! Santorini game-state engine with a cancellable Monte Carlo Tree Search evaluator.
//!
//! The crate is layered bottom-up:
//!
//! * [`codec`] and [`board`] – the 162-entry action space and the compact 5×5×3 board tensor
//!   (75 bytes) shared with the neural-network evaluator. Every helper is deterministic and
//!   allocation-free so it can sit inside the search hot path.
//! * [`SantoriniEngine`] – the authoritative position plus validity mask, undo/redo log,
//!   snapshots and edits. Every mutation goes through one validated path and a rejected call leaves
//!   the engine untouched.
//! * [`SantoriniMcts`] – PUCT search over a transposition table, guided by an injected
//!   [`Evaluator`] and interruptible through a [`CancellationToken`]. Any synchronous
//!   [`Predictor`] is an evaluator; the browser build plugs in one that awaits JavaScript.
//! * [`EngineChannel`] – runs an engine on its own thread behind correlated request/response
//!   messages with single-flight evaluation cancellation. On `wasm32` the same dispatcher is
//!   exposed as `WasmEngineWorker.handleMessage`.

pub mod board;
pub mod cancel;
pub mod channel;
pub mod codec;
pub mod engine;
pub mod error;
pub mod history;
pub mod hooks;
pub mod host;
pub mod mcts;
pub mod predictor;
pub mod protocol;
pub mod snapshot;

#[cfg(target_arch = "wasm32")]
mod wasm;

pub use board::{BoardState, Phase, Position, STATE_SIZE};
pub use cancel::{CancelReason, CancellationToken, SingleFlight};
pub use channel::{ChannelError, ChannelOptions, EngineChannel, Ticket};
pub use codec::{
    decode_action, encode_action, encode_direction, Action, ACTION_SIZE, NO_BUILD, NO_MOVE,
};
pub use engine::{
    BestAction, EditMode, EngineState, Evaluation, MoveSuggestion, Outcome, SantoriniEngine,
};
pub use error::{EngineError, Rejection};
pub use history::{describe_action, HistoryEntry, HistoryView};
pub use hooks::{GameHooks, NoGods};
pub use host::{EngineHost, PredictorFactory};
pub use mcts::{MctsConfig, SantoriniMcts, SearchOutcome, SearchResult, SEARCH_RESULT_VERSION};
pub use predictor::{
    Evaluator, HeuristicPredictor, NetworkPrediction, Predictor, PredictorError, UniformPredictor,
};
pub use protocol::{Command, EnginePreference, ErrorCode, Reply, Request, Response, ResponseError};
pub use snapshot::{MemoryStore, Snapshot, SnapshotStore, SNAPSHOT_VERSION};

#[cfg(target_arch = "wasm32")]
pub use wasm::{init_panic_hook, WasmEngineWorker};
