//! Authoritative game state: position, validity mask, move log and the search engine bound to it.
//!
//! Every transition goes through one validated path (`commit`) that applies the action to a copy
//! of the position, so a rejected call leaves the engine exactly as it was. Terminal flags and the
//! validity mask are re-derived after each committed change.

use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::board::{worker_owner, Cell, Phase, Position, DOME, NUM_PLAYERS};
use crate::cancel::{CancelReason, CancellationToken};
use crate::codec::{placement_action, Action, ACTION_SIZE, BOARD_SIZE};
use crate::error::{EngineError, Rejection};
use crate::history::{build_history, describe_action, HistoryEntry, HistoryView};
use crate::hooks::GameHooks;
use crate::mcts::{SantoriniMcts, SearchOutcome};
use crate::predictor::{resolve_now, Evaluator, Predictor};
use crate::snapshot::{Snapshot, SNAPSHOT_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum EditMode {
    SetHeight { height: u8 },
    /// 0 → 1 → 2 → 3 → dome → 0; an occupied square skips the dome.
    CycleHeight,
    SetWorker { worker: i8 },
    ClearWorker,
}

/// Immutable copy of the engine handed to the UI after every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineState {
    pub player: usize,
    pub phase: Phase,
    pub game_ended: [i8; NUM_PLAYERS],
    pub board: Vec<Cell>,
    pub valid_actions: Vec<usize>,
    pub history_length: usize,
    pub future_length: usize,
    pub round: u16,
    pub num_simulations: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    /// Probability per legal action id; sums to 1 unless the position is terminal.
    pub move_probabilities: BTreeMap<usize, f32>,
    /// `[player 0, player 1]`, zero-sum. Exactly ±1 when `terminal`.
    pub position_value: [f32; NUM_PLAYERS],
    pub simulations: u32,
    pub terminal: bool,
}

impl Evaluation {
    /// Highest-probability legal action; ties go to the lowest id.
    pub fn best_action(&self) -> Option<usize> {
        let mut best: Option<(usize, f32)> = None;
        for (&action, &p) in &self.move_probabilities {
            if best.map_or(true, |(_, top)| p > top) {
                best = Some((action, p));
            }
        }
        best.map(|(action, _)| action)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BestAction {
    pub action: Option<usize>,
    pub evaluation: Evaluation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveSuggestion {
    pub action: usize,
    pub detail: Option<Action>,
    pub probability: f32,
    /// Change in the mover's value after a short follow-up search; absent when `depth == 0`.
    pub eval_delta: Option<f32>,
    pub text: String,
}

/// Result of an evaluation-type call: either finished or cancelled, never partial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "camelCase")]
pub enum Outcome<T> {
    Completed(T),
    Cancelled(CancelReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Branch {
    /// A fresh move discards the redo stack.
    New,
    Redo,
}

pub struct SantoriniEngine<E = Box<dyn Predictor>> {
    position: Position,
    valid: [bool; ACTION_SIZE],
    history: Vec<HistoryEntry>,
    future: Vec<HistoryEntry>,
    metadata: Option<BTreeMap<String, String>>,
    mcts: SantoriniMcts<E>,
    hooks: Box<dyn GameHooks>,
}

impl<E> SantoriniEngine<E> {
    pub fn new(mcts: SantoriniMcts<E>, hooks: Box<dyn GameHooks>) -> Self {
        let mut engine = Self {
            position: Position::new(),
            valid: [false; ACTION_SIZE],
            history: Vec::new(),
            future: Vec::new(),
            metadata: None,
            mcts,
            hooks,
        };
        engine.hooks.post_init_game(&mut engine.position);
        engine.recompute_valid_moves();
        engine
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn valid_moves(&self) -> &[bool; ACTION_SIZE] {
        &self.valid
    }

    pub fn is_valid(&self, action: usize) -> bool {
        self.valid.get(action).copied().unwrap_or(false)
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn future(&self) -> &[HistoryEntry] {
        &self.future
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn state(&self) -> EngineState {
        EngineState {
            player: self.position.player,
            phase: self.position.phase(),
            game_ended: self.position.game_ended,
            board: self.position.board.cells(),
            valid_actions: self
                .valid
                .iter()
                .enumerate()
                .filter_map(|(action, &flag)| flag.then_some(action))
                .collect(),
            history_length: self.history.len(),
            future_length: self.future.len(),
            round: self.position.board.round(),
            num_simulations: self.mcts.config().num_simulations,
        }
    }

    /// Re-derive the mask for the side to move plus terminal flags. A side with no legal move
    /// that has not already won is flagged as lost.
    pub fn recompute_valid_moves(&mut self) {
        self.position.refresh(&mut self.valid);
    }

    pub fn place(&mut self, row: usize, col: usize) -> Result<(), Rejection> {
        if self.position.is_terminal() {
            return Err(Rejection::AlreadyTerminal);
        }
        if self.position.phase() != Phase::Placement {
            return Err(Rejection::WrongPhase {
                current: Phase::Movement,
            });
        }
        let action = placement_action(row, col);
        if row >= BOARD_SIZE || col >= BOARD_SIZE || !self.is_valid(action) {
            return Err(Rejection::IllegalAction { action });
        }
        self.commit(action, Branch::New)
    }

    pub fn apply_move(&mut self, action: usize) -> Result<(), Rejection> {
        if self.position.is_terminal() {
            return Err(Rejection::AlreadyTerminal);
        }
        if self.position.phase() != Phase::Movement {
            return Err(Rejection::WrongPhase {
                current: Phase::Placement,
            });
        }
        self.check_playable(action)?;
        self.commit(action, Branch::New)
    }

    /// Play an action id in whichever phase the game is in.
    pub fn play(&mut self, action: usize) -> Result<(), Rejection> {
        self.check_playable(action)?;
        self.commit(action, Branch::New)
    }

    pub fn undo(&mut self) -> Result<(), Rejection> {
        let entry = self.history.pop().ok_or(Rejection::NothingToUndo)?;
        self.position = Position::from_board(entry.board_before, entry.player);
        self.recompute_valid_moves();
        self.future.push(entry);
        Ok(())
    }

    pub fn redo(&mut self) -> Result<(), Rejection> {
        let action = self
            .future
            .last()
            .and_then(|entry| entry.action)
            .ok_or(Rejection::NothingToRedo)?;
        self.check_playable(action)?;
        self.commit(action, Branch::Redo)?;
        self.future.pop();
        Ok(())
    }

    /// Walk the log until exactly `index` entries are behind the current position.
    pub fn jump_to_move_index(&mut self, index: usize) -> Result<(), Rejection> {
        let len = self.history.len() + self.future.len();
        if index > len {
            return Err(Rejection::MoveIndexOutOfRange { index, len });
        }
        let saved = (self.position, self.valid, self.history.clone(), self.future.clone());
        let walked = self.walk_to(index);
        if walked.is_err() {
            (self.position, self.valid, self.history, self.future) = saved;
        }
        walked
    }

    fn walk_to(&mut self, index: usize) -> Result<(), Rejection> {
        while self.history.len() > index {
            self.undo()?;
        }
        while self.history.len() < index {
            self.redo()?;
        }
        Ok(())
    }

    /// Out-of-band position authoring. The edited position becomes the new start of the log.
    pub fn edit_cell(&mut self, row: usize, col: usize, mode: EditMode) -> Result<(), Rejection> {
        if row >= BOARD_SIZE || col >= BOARD_SIZE {
            return Err(invalid_edit(format!("({row}, {col}) is off the board")));
        }
        let mut board = self.position.board;
        let occupied = board.occupant(row, col) != 0;
        match mode {
            EditMode::SetHeight { height } => {
                let height = height as i8;
                if !(0..=DOME).contains(&height) {
                    return Err(invalid_edit(format!("height {height} is out of range")));
                }
                if occupied && height == DOME {
                    return Err(invalid_edit("cannot dome an occupied square".into()));
                }
                board.set_height(row, col, height);
            }
            EditMode::CycleHeight => {
                let mut height = (board.height(row, col) + 1) % (DOME + 1);
                if occupied && height == DOME {
                    height = 0;
                }
                board.set_height(row, col, height);
            }
            EditMode::SetWorker { worker } => {
                if worker_owner(worker).is_none() {
                    return Err(invalid_edit(format!("unknown worker {worker}")));
                }
                let current = board.occupant(row, col);
                if current != 0 && current != worker {
                    return Err(invalid_edit(format!("square holds worker {current}")));
                }
                if board.height(row, col) >= DOME {
                    return Err(invalid_edit("cannot stand a worker on a dome".into()));
                }
                board.set_occupant(row, col, worker);
            }
            EditMode::ClearWorker => board.set_occupant(row, col, 0),
        }
        self.position = Position::from_board(board, self.position.player);
        self.history.clear();
        self.future.clear();
        self.mcts.clear_tree();
        self.recompute_valid_moves();
        debug!("edited ({row}, {col}) with {mode:?}");
        Ok(())
    }

    pub fn history_view(&self) -> Vec<HistoryView> {
        build_history(&self.history, &self.position.board)
    }

    /// Replay the recorded actions from the first entry's `board_before`.
    pub fn replay_history(&self) -> Result<Position, EngineError> {
        let Some(first) = self.history.first() else {
            return Ok(self.position);
        };
        let mut replay = Position::from_board(first.board_before, first.player);
        let mut valid = [false; ACTION_SIZE];
        replay.refresh(&mut valid);
        for entry in &self.history {
            let action = entry.action.ok_or_else(|| {
                EngineError::InvalidSnapshot("legacy entry cannot be replayed".into())
            })?;
            if !valid[action] || replay.is_terminal() {
                return Err(Rejection::IllegalAction { action }.into());
            }
            replay.apply(action)?;
            self.hooks.post_move(&mut replay, action);
            replay.refresh(&mut valid);
        }
        Ok(replay)
    }

    pub fn export_snapshot(&self) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            player: self.position.player,
            board: self.position.board,
            history: self.history.clone(),
            future: self.future.clone(),
            game_ended: self.position.game_ended,
            valid_moves: self.valid.iter().map(|&flag| u8::from(flag)).collect(),
            metadata: self.metadata.clone(),
        }
    }

    pub fn import_snapshot(&mut self, snapshot: Snapshot) -> Result<(), EngineError> {
        snapshot.validate()?;
        if snapshot.future.iter().any(|entry| entry.action.is_none()) {
            return Err(EngineError::InvalidSnapshot("redo entries need an action".into()));
        }
        let mut position = Position::from_board(snapshot.board, snapshot.player);
        self.hooks.post_init_game(&mut position);
        self.position = position;
        self.history = snapshot.history;
        self.future = snapshot.future;
        self.metadata = snapshot.metadata;
        self.mcts.clear_tree();
        self.recompute_valid_moves();
        if self.position.game_ended != snapshot.game_ended {
            debug!(
                "snapshot terminal flags {:?} re-derived as {:?}",
                snapshot.game_ended, self.position.game_ended
            );
        }
        Ok(())
    }

    pub fn change_difficulty(&mut self, num_simulations: u32) -> Result<(), EngineError> {
        self.mcts.set_num_simulations(num_simulations)
    }

    fn check_playable(&self, action: usize) -> Result<(), Rejection> {
        if self.position.is_terminal() {
            return Err(Rejection::AlreadyTerminal);
        }
        if !self.is_valid(action) {
            return Err(Rejection::IllegalAction { action });
        }
        Ok(())
    }

    fn commit(&mut self, action: usize, branch: Branch) -> Result<(), Rejection> {
        self.hooks.pre_move(&self.position, action)?;
        let entry = HistoryEntry {
            player: self.position.player,
            action: Some(action),
            board_before: self.position.board,
            description: None,
        };
        let mut next = self.position;
        next.apply(action)
            .map_err(|_| Rejection::IllegalAction { action })?;
        self.hooks.post_move(&mut next, action);
        self.position = next;
        self.history.push(entry);
        if branch == Branch::New {
            self.future.clear();
        }
        self.recompute_valid_moves();
        Ok(())
    }
}

impl<E: Evaluator> SantoriniEngine<E> {
    /// Search the current position. Works on a copy of the board; the position is never
    /// touched, whether the search completes or is cancelled.
    pub async fn evaluate_async(
        &mut self,
        token: &CancellationToken,
    ) -> Result<Outcome<Evaluation>, EngineError> {
        if let Some(position_value) = self.position.terminal_values() {
            return Ok(Outcome::Completed(Evaluation {
                move_probabilities: BTreeMap::new(),
                position_value,
                simulations: 0,
                terminal: true,
            }));
        }
        let board = self.position.board;
        let outcome = self
            .mcts
            .search_async(&board, self.position.player, true, token)
            .await?;
        match outcome {
            SearchOutcome::Cancelled(reason) => Ok(Outcome::Cancelled(reason)),
            SearchOutcome::Completed(result) => {
                let mut move_probabilities: BTreeMap<usize, f32> = self
                    .valid
                    .iter()
                    .enumerate()
                    .filter(|(_, &flag)| flag)
                    .map(|(action, _)| (action, result.policy[action]))
                    .collect();
                let total: f32 = move_probabilities.values().sum();
                if total > 0.0 {
                    for p in move_probabilities.values_mut() {
                        *p /= total;
                    }
                }
                Ok(Outcome::Completed(Evaluation {
                    move_probabilities,
                    position_value: result.q,
                    simulations: result.simulations,
                    terminal: false,
                }))
            }
        }
    }

    pub async fn guess_best_action_async(
        &mut self,
        token: &CancellationToken,
    ) -> Result<Outcome<BestAction>, EngineError> {
        Ok(match self.evaluate_async(token).await? {
            Outcome::Cancelled(reason) => Outcome::Cancelled(reason),
            Outcome::Completed(evaluation) => Outcome::Completed(BestAction {
                action: evaluation.best_action(),
                evaluation,
            }),
        })
    }

    /// Top `limit` legal moves by probability. With `depth > 0` each listed move also gets a
    /// follow-up search of `depth × num_simulations / partial_divisor` simulations (capped at
    /// `num_simulations`) and reports how much it changes the mover's value.
    pub async fn list_moves_with_adv_async(
        &mut self,
        limit: usize,
        depth: u32,
        token: &CancellationToken,
    ) -> Result<Outcome<Vec<MoveSuggestion>>, EngineError> {
        let evaluation = match self.evaluate_async(token).await? {
            Outcome::Cancelled(reason) => return Ok(Outcome::Cancelled(reason)),
            Outcome::Completed(evaluation) => evaluation,
        };
        let mut ranked: Vec<(usize, f32)> = evaluation
            .move_probabilities
            .iter()
            .map(|(&action, &p)| (action, p))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(limit);

        let mover = self.position.player;
        let placing = self.position.board.next_placement().is_some();
        let config = self.mcts.config();
        let budget = (config.num_simulations / config.partial_divisor.max(1))
            .max(1)
            .saturating_mul(depth)
            .min(config.num_simulations);

        let mut suggestions = Vec::with_capacity(ranked.len());
        for (action, probability) in ranked {
            let eval_delta = if depth == 0 {
                None
            } else {
                match self.child_value(action, mover, budget, token).await? {
                    Outcome::Cancelled(reason) => return Ok(Outcome::Cancelled(reason)),
                    Outcome::Completed(value) => Some(value - evaluation.position_value[mover]),
                }
            };
            suggestions.push(MoveSuggestion {
                action,
                detail: Action::from_id(action, placing),
                probability,
                eval_delta,
                text: describe_action(&self.position.board, mover, action),
            });
        }
        Ok(Outcome::Completed(suggestions))
    }

    /// Value of the position after `action`, from `mover`'s point of view.
    async fn child_value(
        &mut self,
        action: usize,
        mover: usize,
        budget: u32,
        token: &CancellationToken,
    ) -> Result<Outcome<f32>, EngineError> {
        let mut child = self.position;
        child.apply(action)?;
        let mut valid = [false; ACTION_SIZE];
        child.refresh(&mut valid);
        if let Some(values) = child.terminal_values() {
            return Ok(Outcome::Completed(values[mover]));
        }
        let outcome = self
            .mcts
            .search_with_budget_async(&child.board, child.player, budget, token)
            .await?;
        Ok(match outcome {
            SearchOutcome::Cancelled(reason) => Outcome::Cancelled(reason),
            SearchOutcome::Completed(result) => Outcome::Completed(result.q[mover]),
        })
    }
}

impl<E: Predictor> SantoriniEngine<E> {
    /// Synchronous [`evaluate_async`](Self::evaluate_async) for predictors that answer in place.
    pub fn evaluate(
        &mut self,
        token: &CancellationToken,
    ) -> Result<Outcome<Evaluation>, EngineError> {
        resolve_now(self.evaluate_async(token))?
    }

    pub fn guess_best_action(
        &mut self,
        token: &CancellationToken,
    ) -> Result<Outcome<BestAction>, EngineError> {
        resolve_now(self.guess_best_action_async(token))?
    }

    pub fn list_moves_with_adv(
        &mut self,
        limit: usize,
        depth: u32,
        token: &CancellationToken,
    ) -> Result<Outcome<Vec<MoveSuggestion>>, EngineError> {
        resolve_now(self.list_moves_with_adv_async(limit, depth, token))?
    }
}

fn invalid_edit(detail: String) -> Rejection {
    Rejection::InvalidEdit { detail }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::board::BoardState;
    use crate::codec::{decode_action, encode_action, encode_direction};
    use crate::hooks::NoGods;
    use crate::mcts::MctsConfig;
    use crate::predictor::{HeuristicPredictor, UniformPredictor};

    fn engine_with(num_simulations: u32) -> SantoriniEngine {
        let config = MctsConfig {
            num_simulations,
            ..MctsConfig::default()
        };
        let predictor: Box<dyn Predictor> = Box::new(HeuristicPredictor::default());
        let mut mcts = SantoriniMcts::new(config, predictor).expect("config");
        mcts.set_seed(11);
        SantoriniEngine::new(mcts, Box::new(NoGods))
    }

    fn opened_engine() -> SantoriniEngine {
        let mut engine = engine_with(32);
        for (row, col) in [(0, 0), (0, 4), (4, 0), (4, 4)] {
            engine.place(row, col).expect("placement");
        }
        engine
    }

    fn import(engine: &mut SantoriniEngine, board: BoardState, player: usize) {
        engine
            .import_snapshot(Snapshot {
                version: SNAPSHOT_VERSION,
                player,
                board,
                history: Vec::new(),
                future: Vec::new(),
                game_ended: [0, 0],
                valid_moves: Vec::new(),
                metadata: None,
            })
            .expect("snapshot imports");
    }

    fn first_legal(engine: &SantoriniEngine) -> usize {
        engine.valid_moves().iter().position(|&flag| flag).expect("a legal move")
    }

    #[test]
    fn placement_phase_flips_atomically() {
        let mut engine = engine_with(8);
        assert_eq!(engine.position().phase(), Phase::Placement);
        assert_eq!(engine.state().valid_actions.len(), 25);
        engine.place(0, 0).expect("p0 w1");
        engine.place(0, 4).expect("p0 w2");
        assert_eq!(engine.position().player, 1);
        engine.place(4, 0).expect("p1 w1");
        assert_eq!(engine.position().phase(), Phase::Placement);
        engine.place(4, 4).expect("p1 w2");
        assert_eq!(engine.position().phase(), Phase::Movement);
        assert_eq!(engine.position().player, 0);
        assert!(engine.state().valid_actions.iter().all(|&a| a < ACTION_SIZE));
    }

    #[test]
    fn rejections_leave_state_untouched() {
        let mut engine = engine_with(8);
        engine.place(2, 2).expect("placement");
        let before = engine.export_snapshot();

        assert_eq!(
            engine.place(2, 2),
            Err(Rejection::IllegalAction {
                action: placement_action(2, 2)
            })
        );
        assert_eq!(
            engine.apply_move(encode_action(0, 1, 1)),
            Err(Rejection::WrongPhase {
                current: Phase::Placement
            })
        );
        assert_eq!(engine.export_snapshot(), before);

        let mut engine = opened_engine();
        let before = engine.export_snapshot();
        assert_eq!(
            engine.place(2, 2),
            Err(Rejection::WrongPhase {
                current: Phase::Movement
            })
        );
        // Worker 1 at (0,0) cannot move north-west off the board.
        assert_eq!(
            engine.apply_move(encode_action(0, 0, 1)),
            Err(Rejection::IllegalAction {
                action: encode_action(0, 0, 1)
            })
        );
        assert!(matches!(
            engine.apply_move(ACTION_SIZE + 3),
            Err(Rejection::IllegalAction { .. })
        ));
        assert_eq!(engine.export_snapshot(), before);
        assert_eq!(engine_with(8).undo(), Err(Rejection::NothingToUndo));
        assert_eq!(engine_with(8).redo(), Err(Rejection::NothingToRedo));
    }

    #[test]
    fn undo_then_redo_is_symmetric() {
        let mut engine = opened_engine();
        let position = *engine.position();
        let mask = *engine.valid_moves();
        let action = first_legal(&engine);

        engine.apply_move(action).expect("legal");
        let after = *engine.position();
        let after_mask = *engine.valid_moves();

        engine.undo().expect("undo");
        assert_eq!(*engine.position(), position);
        assert_eq!(*engine.valid_moves(), mask);
        assert_eq!(engine.future().len(), 1);

        engine.redo().expect("redo");
        assert_eq!(*engine.position(), after);
        assert_eq!(*engine.valid_moves(), after_mask);
        assert!(engine.future().is_empty());
    }

    #[test]
    fn new_move_after_undo_prunes_future() {
        let mut engine = opened_engine();
        let first = first_legal(&engine);
        engine.apply_move(first).expect("legal");
        engine.undo().expect("undo");
        let other = engine
            .valid_moves()
            .iter()
            .enumerate()
            .rev()
            .find(|(_, &flag)| flag)
            .map(|(action, _)| action)
            .expect("another legal move");
        assert_ne!(first, other);
        engine.apply_move(other).expect("legal");
        assert!(engine.future().is_empty());
        assert_eq!(engine.redo(), Err(Rejection::NothingToRedo));
    }

    #[test]
    fn replaying_history_reproduces_the_live_position() {
        let mut rng = SmallRng::seed_from_u64(2024);
        for _ in 0..5 {
            let mut engine = engine_with(8);
            for _ in 0..60 {
                if engine.position().is_terminal() {
                    break;
                }
                let legal = engine.state().valid_actions;
                let action = legal[rng.gen_range(0..legal.len())];
                engine.play(action).expect("legal action");
            }
            let replayed = engine.replay_history().expect("replay");
            assert_eq!(replayed, *engine.position());

            let total = engine.history_len();
            engine.jump_to_move_index(total / 2).expect("jump back");
            assert_eq!(engine.history_len(), total / 2);
            engine.jump_to_move_index(total).expect("jump forward");
            assert_eq!(replayed, *engine.position());
        }
    }

    #[test]
    fn terminal_position_refuses_moves() {
        let mut engine = engine_with(8);
        let mut board = BoardState::new();
        for (action, player) in [(0, 0), (4, 0), (20, 1), (24, 1)] {
            board.make_move(action, player).expect("placement");
        }
        board.set_height(0, 0, 2);
        board.set_height(0, 1, 3);
        import(&mut engine, board, 0);
        let win = encode_action(0, encode_direction(0, 0, 0, 1).expect("adj"), 7);
        engine.apply_move(win).expect("winning move");
        assert_eq!(engine.position().game_ended, [1, 0]);
        assert_eq!(engine.apply_move(0), Err(Rejection::AlreadyTerminal));
        assert_eq!(engine.play(0), Err(Rejection::AlreadyTerminal));
        assert_eq!(engine.place(2, 2), Err(Rejection::AlreadyTerminal));
    }

    #[test]
    fn editing_rebases_the_log_and_recomputes() {
        let mut engine = opened_engine();
        engine.apply_move(first_legal(&engine)).expect("legal");
        assert_eq!(engine.history_len(), 1);

        engine
            .edit_cell(2, 2, EditMode::SetHeight { height: 3 })
            .expect("edit");
        assert_eq!(engine.history_len(), 0);
        assert_eq!(engine.position().board.height(2, 2), 3);

        engine.edit_cell(2, 2, EditMode::CycleHeight).expect("cycle");
        assert_eq!(engine.position().board.height(2, 2), DOME);
        engine.edit_cell(2, 2, EditMode::CycleHeight).expect("cycle");
        assert_eq!(engine.position().board.height(2, 2), 0);

        assert!(matches!(
            engine.edit_cell(0, 4, EditMode::SetHeight { height: 4 }),
            Err(Rejection::InvalidEdit { .. })
        ));
        assert!(matches!(
            engine.edit_cell(0, 4, EditMode::SetWorker { worker: -1 }),
            Err(Rejection::InvalidEdit { .. })
        ));
        assert!(matches!(
            engine.edit_cell(9, 0, EditMode::ClearWorker),
            Err(Rejection::InvalidEdit { .. })
        ));

        // Removing a worker sends the game back to placement for that worker's owner.
        let owner_cell = engine
            .position()
            .board
            .find_worker(-2)
            .expect("p1 worker 2 on board");
        engine
            .edit_cell(owner_cell.0, owner_cell.1, EditMode::ClearWorker)
            .expect("clear");
        assert_eq!(engine.position().phase(), Phase::Placement);
        assert_eq!(engine.position().player, 1);

        engine
            .edit_cell(2, 3, EditMode::SetWorker { worker: -2 })
            .expect("set worker");
        assert_eq!(engine.position().phase(), Phase::Movement);
        assert_eq!(engine.replay_history().expect("empty log"), *engine.position());
    }

    #[test]
    fn worker_one_steps_east_onto_the_tower_and_wins() {
        let mut engine = engine_with(64);
        let mut board = BoardState::new();
        for (action, player) in [
            (placement_action(0, 0), 0),
            (placement_action(0, 4), 0),
            (placement_action(2, 1), 1),
            (placement_action(4, 4), 1),
        ] {
            board.make_move(action, player).expect("placement");
        }
        board.set_height(2, 1, 2);
        board.set_height(2, 2, 3);
        board.set_height(1, 2, 1);
        import(&mut engine, board, 1);

        let east = encode_direction(2, 1, 2, 2).expect("adjacent");
        let north = encode_direction(2, 2, 1, 2).expect("adjacent");
        let winning = encode_action(0, east, north);
        assert!(engine.is_valid(winning));
        assert_eq!(engine.position().game_ended, [0, 0]);

        let Outcome::Completed(best) = engine
            .guess_best_action(&CancellationToken::new())
            .expect("search")
        else {
            panic!("not cancelled");
        };
        assert!(!best.evaluation.terminal);
        assert!(best.evaluation.position_value[1] > 0.8);
        let (worker, move_direction, _) = decode_action(best.action.expect("a move"));
        assert_eq!((worker, move_direction), (0, east));

        engine.apply_move(winning).expect("legal");
        assert_eq!(engine.position().game_ended, [0, 1]);
        assert_eq!(engine.position().board.height(1, 2), 1, "winning move skips the build");

        let Outcome::Completed(after) = engine.evaluate(&CancellationToken::new()).expect("eval")
        else {
            panic!("not cancelled");
        };
        assert!(after.terminal);
        assert!(after.position_value[0] < -0.8);
        assert!(after.position_value[1] > 0.8);
    }

    #[test]
    fn evaluation_masses_only_legal_actions() {
        let mut engine = opened_engine();
        let position = *engine.position();
        let Outcome::Completed(evaluation) = engine
            .evaluate(&CancellationToken::new())
            .expect("search")
        else {
            panic!("not cancelled");
        };
        let total: f32 = evaluation.move_probabilities.values().sum();
        assert!((total - 1.0).abs() < 1e-4);
        for action in evaluation.move_probabilities.keys() {
            assert!(engine.is_valid(*action));
        }
        assert_eq!(
            evaluation.move_probabilities.len(),
            engine.state().valid_actions.len()
        );
        assert_eq!(*engine.position(), position);
    }

    #[test]
    fn cancelled_evaluation_does_not_touch_position() {
        let mut engine = opened_engine();
        let before = engine.export_snapshot();
        let token = CancellationToken::new();
        token.cancel(CancelReason::Requested);
        let outcome = engine.evaluate(&token).expect("no error");
        assert_eq!(outcome, Outcome::Cancelled(CancelReason::Requested));
        assert_eq!(engine.export_snapshot(), before);
    }

    #[test]
    fn suggestions_are_ranked_and_described() {
        let mut engine = opened_engine();
        let Outcome::Completed(moves) = engine
            .list_moves_with_adv(3, 1, &CancellationToken::new())
            .expect("search")
        else {
            panic!("not cancelled");
        };
        assert_eq!(moves.len(), 3);
        assert!(moves.windows(2).all(|w| w[0].probability >= w[1].probability));
        assert!(moves.iter().all(|m| m.eval_delta.is_some()));
        assert!(moves.iter().all(|m| m.text.starts_with("Player 1 moves worker")));
        assert!(moves
            .iter()
            .all(|m| matches!(m.detail, Some(Action::Move { worker: 0 | 1, .. }))));
        assert!(moves.iter().all(|m| m.detail.map(|d| d.id()) == Some(m.action)));

        let Outcome::Completed(plain) = engine
            .list_moves_with_adv(2, 0, &CancellationToken::new())
            .expect("search")
        else {
            panic!("not cancelled");
        };
        assert!(plain.iter().all(|m| m.eval_delta.is_none()));
    }

    #[test]
    fn snapshot_round_trip_and_validation() {
        let mut engine = opened_engine();
        engine.apply_move(first_legal(&engine)).expect("legal");
        engine.undo().expect("undo");
        let snapshot = engine.export_snapshot();

        let mut restored = engine_with(8);
        restored.import_snapshot(snapshot.clone()).expect("import");
        assert_eq!(restored.export_snapshot(), snapshot);
        restored.redo().expect("redo from imported future");

        let mut bad = snapshot.clone();
        bad.version = 99;
        assert!(matches!(
            restored.import_snapshot(bad),
            Err(EngineError::InvalidSnapshot(_))
        ));
        let mut stray = snapshot;
        stray.history.push(HistoryEntry {
            player: 5,
            action: None,
            board_before: stray.board,
            description: None,
        });
        assert!(matches!(
            restored.import_snapshot(stray),
            Err(EngineError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn edits_and_imports_drop_the_search_tree() {
        let mut engine = opened_engine();
        engine.evaluate(&CancellationToken::new()).expect("search");
        assert!(engine.mcts.tree_size() > 0);
        engine.edit_cell(2, 2, EditMode::CycleHeight).expect("edit");
        assert_eq!(engine.mcts.tree_size(), 0);

        engine.evaluate(&CancellationToken::new()).expect("search");
        assert!(engine.mcts.tree_size() > 0);
        let snapshot = engine.export_snapshot();
        engine.import_snapshot(snapshot).expect("import");
        assert_eq!(engine.mcts.tree_size(), 0);

        // Plain play keeps the tree for reuse.
        engine.evaluate(&CancellationToken::new()).expect("search");
        let cached = engine.mcts.tree_size();
        engine.apply_move(first_legal(&engine)).expect("legal");
        assert_eq!(engine.mcts.tree_size(), cached);
    }

    #[test]
    fn difficulty_changes_budget() {
        let mut engine = engine_with(8);
        engine.change_difficulty(24).expect("valid");
        assert_eq!(engine.state().num_simulations, 24);
        assert!(engine.change_difficulty(0).is_err());
        assert_eq!(engine.state().num_simulations, 24);
    }

    struct CountingHooks {
        moves: Arc<AtomicUsize>,
        veto: Option<usize>,
    }

    impl GameHooks for CountingHooks {
        fn pre_move(&self, _position: &Position, action: usize) -> Result<(), Rejection> {
            if self.veto == Some(action) {
                return Err(Rejection::IllegalAction { action });
            }
            Ok(())
        }

        fn post_move(&self, _position: &mut Position, _action: usize) {
            self.moves.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn hooks_observe_and_veto_transitions() {
        let moves = Arc::new(AtomicUsize::new(0));
        let hooks = CountingHooks {
            moves: Arc::clone(&moves),
            veto: Some(placement_action(1, 1)),
        };
        let mcts = SantoriniMcts::new(MctsConfig::default(), Box::new(UniformPredictor))
            .expect("config");
        let mut engine = SantoriniEngine::new(mcts, Box::new(hooks));
        engine.place(0, 0).expect("placement");
        assert_eq!(moves.load(Ordering::SeqCst), 1);
        assert!(engine.place(1, 1).is_err());
        assert_eq!(moves.load(Ordering::SeqCst), 1);
        assert_eq!(engine.history_len(), 1);
    }
}
