use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{
    decode_action, encode_action, placement_cell, step, ACTION_SIZE, BOARD_SIZE, CELL_COUNT,
    DIRECTION_COUNT, NB_WORKERS, NO_BUILD, NO_MOVE, PLACEMENT_ACTIONS,
};

pub const CHANNELS: usize = 3;
pub const STATE_SIZE: usize = CELL_COUNT * CHANNELS; // 75 i8 entries
pub const NUM_PLAYERS: usize = 2;
/// A level-4 cell carries a dome: impassable and unbuildable.
pub const DOME: i8 = 4;
pub const WINNING_LEVEL: i8 = 3;
const MAX_ROUND: u16 = 127;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BoardError {
    #[error("expected {STATE_SIZE} entries for board state, got {0}")]
    BadLength(usize),
    #[error("placement index {0} is outside the board")]
    PlacementOutOfRange(usize),
    #[error("cannot place worker on occupied square ({0}, {1})")]
    Occupied(usize, usize),
    #[error("player {player} attempted to place worker for player {expected}")]
    WrongPlacementPlayer { player: usize, expected: usize },
    #[error("missing worker {worker} for player {player}")]
    MissingWorker { worker: i8, player: usize },
    #[error("action {0} steps off the board")]
    OffBoard(usize),
    #[error("action {0} is outside the action space")]
    ActionOutOfRange(usize),
}

#[inline]
pub const fn idx(y: usize, x: usize) -> usize {
    y * BOARD_SIZE + x
}

/// Signed worker id: `+1`/`+2` belong to player 0, `-1`/`-2` to player 1.
#[inline]
pub const fn worker_id(player: usize, worker: usize) -> i8 {
    let sign = if player == 0 { 1 } else { -1 };
    (worker as i8 + 1) * sign
}

#[inline]
pub const fn worker_owner(id: i8) -> Option<usize> {
    match id {
        1 | 2 => Some(0),
        -1 | -2 => Some(1),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Placement,
    Movement,
}

/// Read-only view of one square.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub occupant: Option<i8>,
    pub height: u8,
}

/// Compact board: worker layer, level layer and a round counter mirroring the legacy 5×5×3
/// tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoardState {
    workers: [i8; CELL_COUNT],
    levels: [i8; CELL_COUNT],
    round: u16,
}

impl BoardState {
    pub fn new() -> Self {
        Self {
            workers: [0; CELL_COUNT],
            levels: [0; CELL_COUNT],
            round: 0,
        }
    }

    pub fn as_bytes(&self) -> [i8; STATE_SIZE] {
        let mut flat = [0; STATE_SIZE];
        self.write_into_slice(&mut flat);
        flat
    }

    pub fn from_bytes(bytes: &[i8]) -> Result<Self, BoardError> {
        if bytes.len() != STATE_SIZE {
            return Err(BoardError::BadLength(bytes.len()));
        }
        let mut state = Self::new();
        for (i, chunk) in bytes.chunks_exact(CHANNELS).enumerate() {
            state.workers[i] = chunk[0];
            state.levels[i] = chunk[1];
            if i == 0 {
                state.round = chunk[2].clamp(0, MAX_ROUND as i8) as u16;
            }
        }
        Ok(state)
    }

    pub fn canonicalised(&self, player: usize) -> Self {
        if player == 0 {
            *self
        } else {
            let mut clone = *self;
            for w in &mut clone.workers {
                *w = -*w;
            }
            clone
        }
    }

    pub fn cell(&self, row: usize, col: usize) -> Cell {
        let index = idx(row, col);
        let occupant = self.workers[index];
        Cell {
            occupant: (occupant != 0).then_some(occupant),
            height: self.levels[index] as u8,
        }
    }

    pub fn cells(&self) -> Vec<Cell> {
        (0..CELL_COUNT)
            .map(|i| self.cell(i / BOARD_SIZE, i % BOARD_SIZE))
            .collect()
    }

    pub fn height(&self, row: usize, col: usize) -> i8 {
        self.levels[idx(row, col)]
    }

    pub fn occupant(&self, row: usize, col: usize) -> i8 {
        self.workers[idx(row, col)]
    }

    /// Out-of-band level write used by position editing. Callers validate the range.
    pub(crate) fn set_height(&mut self, row: usize, col: usize, height: i8) {
        self.levels[idx(row, col)] = height;
    }

    /// Out-of-band worker write used by position editing; a worker id already on the board is
    /// lifted from its old square first so every worker occupies exactly one cell.
    pub(crate) fn set_occupant(&mut self, row: usize, col: usize, worker: i8) {
        if worker != 0 {
            if let Some((y, x)) = self.find_worker(worker) {
                self.workers[idx(y, x)] = 0;
            }
        }
        self.workers[idx(row, col)] = worker;
    }

    pub fn valid_moves(&self, player: usize, out: &mut [bool; ACTION_SIZE]) {
        out.fill(false);

        if self.next_placement().is_some() {
            for index in 0..CELL_COUNT {
                out[index] = self.workers[index] == 0;
            }
            return;
        }

        for worker in 0..NB_WORKERS {
            let id = worker_id(player, worker);
            let Some(position) = self.find_worker(id) else {
                continue;
            };

            for move_direction in 0..DIRECTION_COUNT {
                if move_direction == NO_MOVE {
                    continue;
                }
                let Some(target) = step(position, move_direction) else {
                    continue;
                };
                if !self.can_move(position, target) {
                    continue;
                }
                for build_direction in 0..DIRECTION_COUNT {
                    if build_direction == NO_BUILD {
                        continue;
                    }
                    let Some(build_pos) = step(target, build_direction) else {
                        continue;
                    };
                    if !self.can_build(build_pos, id) {
                        continue;
                    }
                    out[encode_action(worker, move_direction, build_direction)] = true;
                }
            }
        }
    }

    /// Apply a placement or move for `player` and return the next player to act.
    ///
    /// A move onto a level-3 square wins immediately and skips the build; this is the only
    /// encoded action that does not perform exactly one move and one build.
    pub fn make_move(&mut self, action: usize, player: usize) -> Result<usize, BoardError> {
        if let Some((placement_player, worker_to_place)) = self.next_placement() {
            if action >= PLACEMENT_ACTIONS {
                return Err(BoardError::PlacementOutOfRange(action));
            }
            if placement_player != player {
                return Err(BoardError::WrongPlacementPlayer {
                    player,
                    expected: placement_player,
                });
            }
            let (y, x) = placement_cell(action);
            if self.workers[idx(y, x)] != 0 {
                return Err(BoardError::Occupied(y, x));
            }
            self.workers[idx(y, x)] = worker_to_place;
            self.bump_round();
            return Ok(match worker_to_place {
                1 | -1 => placement_player,
                _ => 1 - placement_player,
            });
        }

        if action >= ACTION_SIZE {
            return Err(BoardError::ActionOutOfRange(action));
        }
        let (worker, move_direction, build_direction) = decode_action(action);
        let id = worker_id(player, worker);
        let old_pos = self
            .find_worker(id)
            .ok_or(BoardError::MissingWorker { worker: id, player })?;
        let target = step(old_pos, move_direction).ok_or(BoardError::OffBoard(action))?;

        self.workers[idx(old_pos.0, old_pos.1)] = 0;
        self.workers[idx(target.0, target.1)] = id;

        let wins = self.levels[idx(target.0, target.1)] == WINNING_LEVEL;
        if !wins && build_direction != NO_BUILD {
            let build_pos = step(target, build_direction).ok_or(BoardError::OffBoard(action))?;
            let index = idx(build_pos.0, build_pos.1);
            self.levels[index] = (self.levels[index] + 1).min(DOME);
        }

        self.bump_round();
        Ok(1 - player)
    }

    /// Zero-sum result from player 0's point of view, `None` while the game is running.
    pub fn result_value(&self, next_player: usize) -> Option<f32> {
        if self.next_placement().is_some() {
            return None;
        }
        if self.score_for(0) == WINNING_LEVEL {
            return Some(1.0);
        }
        if self.score_for(1) == WINNING_LEVEL {
            return Some(-1.0);
        }
        if !self.has_any_valid_move(next_player) {
            return Some(if next_player == 0 { -1.0 } else { 1.0 });
        }
        None
    }

    pub fn round(&self) -> u16 {
        self.round
    }

    pub fn score_for(&self, player: usize) -> i8 {
        let mut highest = 0;
        for cell in 0..CELL_COUNT {
            if worker_owner(self.workers[cell]) == Some(player) {
                highest = highest.max(self.levels[cell]);
            }
        }
        highest
    }

    pub fn write_into_slice(&self, target: &mut [i8]) {
        debug_assert_eq!(target.len(), STATE_SIZE, "slice must be length 75");
        for (i, chunk) in target.chunks_exact_mut(CHANNELS).enumerate() {
            chunk[0] = self.workers[i];
            chunk[1] = self.levels[i];
            chunk[2] = if i == 0 { self.round.min(MAX_ROUND) as i8 } else { 0 };
        }
    }

    pub fn key(&self) -> [i8; STATE_SIZE] {
        self.as_bytes()
    }

    /// Placement still owed as `(player, worker id)`, or `None` once all four workers stand.
    pub fn next_placement(&self) -> Option<(usize, i8)> {
        [(0, 1), (0, 2), (1, -1), (1, -2)]
            .into_iter()
            .find(|&(_, worker)| self.find_worker(worker).is_none())
    }

    pub fn phase(&self) -> Phase {
        if self.next_placement().is_some() {
            Phase::Placement
        } else {
            Phase::Movement
        }
    }

    pub fn find_worker(&self, worker: i8) -> Option<(usize, usize)> {
        self.workers
            .iter()
            .position(|&w| w == worker)
            .map(|i| (i / BOARD_SIZE, i % BOARD_SIZE))
    }

    fn has_any_valid_move(&self, player: usize) -> bool {
        let mut mask = [false; ACTION_SIZE];
        self.valid_moves(player, &mut mask);
        mask.iter().any(|&flag| flag)
    }

    fn can_move(&self, old_pos: (usize, usize), new_pos: (usize, usize)) -> bool {
        if old_pos == new_pos {
            return true;
        }
        let target_index = idx(new_pos.0, new_pos.1);
        if self.workers[target_index] != 0 {
            return false;
        }
        let new_level = self.levels[target_index];
        if new_level >= DOME {
            return false;
        }
        let old_level = self.levels[idx(old_pos.0, old_pos.1)];
        new_level <= old_level + 1
    }

    fn can_build(&self, pos: (usize, usize), ignore: i8) -> bool {
        let index = idx(pos.0, pos.1);
        let occupant = self.workers[index];
        if occupant != 0 && occupant != ignore {
            return false;
        }
        self.levels[index] < DOME
    }

    fn bump_round(&mut self) {
        if self.round < MAX_ROUND {
            self.round += 1;
        }
    }
}

impl Default for BoardState {
    fn default() -> Self {
        Self::new()
    }
}

/// Board plus turn and terminal data. `game_ended[p]` is `1` once player `p` has won, `-1` once
/// player `p` has lost by having no legal move, `0` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub board: BoardState,
    pub player: usize,
    pub game_ended: [i8; NUM_PLAYERS],
}

impl Position {
    pub fn new() -> Self {
        Self::from_board(BoardState::new(), 0)
    }

    pub fn from_board(board: BoardState, player: usize) -> Self {
        Self {
            board,
            player,
            game_ended: [0; NUM_PLAYERS],
        }
    }

    pub fn phase(&self) -> Phase {
        self.board.phase()
    }

    pub fn is_terminal(&self) -> bool {
        self.game_ended.iter().any(|&flag| flag != 0)
    }

    pub fn winner(&self) -> Option<usize> {
        if let Some(p) = self.game_ended.iter().position(|&flag| flag > 0) {
            return Some(p);
        }
        self.game_ended
            .iter()
            .position(|&flag| flag < 0)
            .map(|loser| 1 - loser)
    }

    /// Commit an action for the side to move. The caller has already checked the validity mask.
    pub fn apply(&mut self, action: usize) -> Result<(), BoardError> {
        let mover = self.player;
        self.player = self.board.make_move(action, mover)?;
        if self.phase() == Phase::Movement && self.board.score_for(mover) == WINNING_LEVEL {
            self.game_ended[mover] = 1;
        }
        Ok(())
    }

    /// Recompute the mask for the side to move and derive terminal flags from the board alone.
    pub fn refresh(&mut self, valid: &mut [bool; ACTION_SIZE]) {
        if let Some((placement_player, _)) = self.board.next_placement() {
            self.player = placement_player;
        }
        self.game_ended = [0; NUM_PLAYERS];
        self.board.valid_moves(self.player, valid);
        if self.phase() == Phase::Placement {
            return;
        }
        for p in 0..NUM_PLAYERS {
            if self.board.score_for(p) == WINNING_LEVEL {
                self.game_ended[p] = 1;
            }
        }
        if !self.is_terminal() && !valid.iter().any(|&flag| flag) {
            self.game_ended[self.player] = -1;
        }
    }

    /// Zero-sum value pair `[p0, p1]` for a finished game.
    pub fn terminal_values(&self) -> Option<[f32; NUM_PLAYERS]> {
        let winner = self.winner()?;
        Some(if winner == 0 { [1.0, -1.0] } else { [-1.0, 1.0] })
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::{encode_direction, placement_action};

    /// Standard opening: P0 at (0,0)/(0,4), P1 at (4,0)/(4,4).
    pub(crate) fn opened_board() -> BoardState {
        let mut board = BoardState::new();
        for (player, cell) in [(0, (0, 0)), (0, (0, 4)), (1, (4, 0)), (1, (4, 4))] {
            board
                .make_move(placement_action(cell.0, cell.1), player)
                .expect("placement");
        }
        board
    }

    #[test]
    fn roundtrip_serialisation() {
        let mut board = BoardState::new();
        board.workers[idx(0, 0)] = 1;
        board.workers[idx(4, 4)] = -2;
        board.levels[idx(2, 2)] = 3;
        board.round = 42;

        let mut buffer = [0i8; STATE_SIZE];
        board.write_into_slice(&mut buffer);
        let reconstructed = BoardState::from_bytes(&buffer).expect("75 entries");

        assert_eq!(board.workers, reconstructed.workers);
        assert_eq!(board.levels, reconstructed.levels);
        assert_eq!(board.round(), reconstructed.round());
        assert!(BoardState::from_bytes(&buffer[..10]).is_err());
    }

    #[test]
    fn canonicalisation_swaps_players() {
        let mut board = BoardState::new();
        board.workers[idx(1, 1)] = 1;
        board.workers[idx(3, 3)] = -1;

        let flipped = board.canonicalised(1);
        assert_eq!(flipped.workers[idx(1, 1)], -1);
        assert_eq!(flipped.workers[idx(3, 3)], 1);
    }

    #[test]
    fn placement_order_hands_turn_over_after_second_worker() {
        let mut board = BoardState::new();
        assert_eq!(board.next_placement(), Some((0, 1)));
        assert_eq!(board.make_move(placement_action(1, 1), 0), Ok(0));
        assert_eq!(board.make_move(placement_action(1, 2), 0), Ok(1));
        assert_eq!(
            board.make_move(placement_action(1, 1), 1),
            Err(BoardError::Occupied(1, 1))
        );
        assert_eq!(board.make_move(placement_action(3, 1), 1), Ok(1));
        assert_eq!(board.make_move(placement_action(3, 2), 1), Ok(0));
        assert_eq!(board.phase(), Phase::Movement);
        assert_eq!(board.round(), 4);
    }

    #[test]
    fn climb_limit_and_domes_filter_moves() {
        let mut board = opened_board();
        board.levels[idx(0, 1)] = 2;
        board.levels[idx(1, 0)] = DOME;
        board.levels[idx(1, 1)] = 1;
        let mut mask = [false; ACTION_SIZE];
        board.valid_moves(0, &mut mask);

        let east = encode_direction(0, 0, 0, 1).expect("adjacent");
        let south = encode_direction(0, 0, 1, 0).expect("adjacent");
        let south_east = encode_direction(0, 0, 1, 1).expect("adjacent");
        let any_build = |dir: usize| (0..DIRECTION_COUNT).any(|b| mask[encode_action(0, dir, b)]);
        assert!(!any_build(east), "two-level climb is illegal");
        assert!(!any_build(south), "domed square is impassable");
        assert!(any_build(south_east));
    }

    #[test]
    fn winning_move_skips_build() {
        let mut board = opened_board();
        board.levels[idx(0, 0)] = 2;
        board.levels[idx(0, 1)] = 3;
        let east = encode_direction(0, 0, 0, 1).expect("adjacent");
        let south = encode_direction(0, 1, 1, 1).expect("adjacent");
        let next = board.make_move(encode_action(0, east, south), 0).expect("legal");
        assert_eq!(next, 1);
        assert_eq!(board.levels[idx(1, 1)], 0, "winning move must not build");
        assert_eq!(board.score_for(0), WINNING_LEVEL);
        assert_eq!(board.result_value(1), Some(1.0));
    }

    #[test]
    fn position_flags_stalemated_player() {
        let mut board = opened_board();
        // Box in player 1's workers with domes.
        for (y, x) in [(3, 0), (3, 1), (4, 1), (3, 3), (3, 4), (4, 3)] {
            board.levels[idx(y, x)] = DOME;
        }
        let mut position = Position::from_board(board, 1);
        let mut mask = [false; ACTION_SIZE];
        position.refresh(&mut mask);
        assert_eq!(position.game_ended, [0, -1]);
        assert_eq!(position.winner(), Some(0));
        assert_eq!(position.terminal_values(), Some([1.0, -1.0]));
    }
}
