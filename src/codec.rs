//! Bijective mapping between compact action ids and `(worker, move, build)` triples.
//!
//! The layout matches the legacy no-gods model head: `2 workers × 9 move directions × 9 build
//! directions = 162` ids, ordered lexicographically by `(worker, move_direction,
//! build_direction)`. Placement actions reuse the first 25 ids as cell indices (`row * 5 + col`);
//! the game phase decides which interpretation applies.
//!
//! Directions are derived from signed deltas: each of `d_row`, `d_col ∈ {-1, 0, 1}` is shifted to
//! `{0, 1, 2}` and combined as `row * 3 + col`, so index 4 is the zero displacement used as the
//! `NO_MOVE` / `NO_BUILD` sentinel.

use serde::{Deserialize, Serialize};

pub const BOARD_SIZE: usize = 5;
pub const CELL_COUNT: usize = BOARD_SIZE * BOARD_SIZE;
pub const NB_GODS: usize = 1;
pub const NB_WORKERS: usize = 2;
pub const DIRECTION_COUNT: usize = 9;
pub const ACTION_SIZE: usize = NB_GODS * NB_WORKERS * DIRECTION_COUNT * DIRECTION_COUNT; // 162
pub const PLACEMENT_ACTIONS: usize = CELL_COUNT; // First 25 indices are dedicated to placements

/// Zero displacement; a worker that "moves" here stays put.
pub const NO_MOVE: usize = 4;
/// Zero displacement used as the build direction of a move that wins outright.
pub const NO_BUILD: usize = 4;

pub const DIRECTIONS: [(i8, i8); DIRECTION_COUNT] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 0),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

const DIRECTION_NAMES: [&str; DIRECTION_COUNT] = ["NW", "N", "NE", "W", "-", "E", "SW", "S", "SE"];

/// Encode a move triple.
///
/// # Preconditions
/// `worker < 2`, `move_direction < 9`, `build_direction < 9`. Values outside these ranges are a
/// caller bug (checked in debug builds only) and produce an id that does not decode back.
#[inline]
pub const fn encode_action(worker: usize, move_direction: usize, build_direction: usize) -> usize {
    debug_assert!(worker < NB_WORKERS);
    debug_assert!(move_direction < DIRECTION_COUNT);
    debug_assert!(build_direction < DIRECTION_COUNT);
    // No gods support – power channel is always zero.
    NB_GODS * DIRECTION_COUNT * DIRECTION_COUNT * worker
        + DIRECTION_COUNT * move_direction
        + build_direction
}

/// Exact inverse of [`encode_action`] for every id in `0..ACTION_SIZE`.
#[inline]
pub const fn decode_action(action: usize) -> (usize, usize, usize) {
    let worker = action / (NB_GODS * DIRECTION_COUNT * DIRECTION_COUNT);
    let remainder = action % (NB_GODS * DIRECTION_COUNT * DIRECTION_COUNT);
    let move_direction = remainder / DIRECTION_COUNT;
    let build_direction = remainder % DIRECTION_COUNT;
    (worker, move_direction, build_direction)
}

/// Direction index for a displacement of at most one cell per axis, `None` otherwise.
pub fn encode_direction(from_row: i8, from_col: i8, to_row: i8, to_col: i8) -> Option<usize> {
    let d_row = to_row - from_row;
    let d_col = to_col - from_col;
    if !(-1..=1).contains(&d_row) || !(-1..=1).contains(&d_col) {
        return None;
    }
    Some(((d_row + 1) * 3 + (d_col + 1)) as usize)
}

/// Unbounded inverse of [`encode_direction`]; may step off the board.
#[inline]
pub const fn apply_direction(row: i8, col: i8, direction: usize) -> (i8, i8) {
    let delta = DIRECTIONS[direction];
    (row + delta.0, col + delta.1)
}

/// Board-bounded step, `None` when the target falls off the 5×5 grid.
#[inline]
pub fn step(position: (usize, usize), direction: usize) -> Option<(usize, usize)> {
    let (ny, nx) = apply_direction(position.0 as i8, position.1 as i8, direction);
    if (0..BOARD_SIZE as i8).contains(&ny) && (0..BOARD_SIZE as i8).contains(&nx) {
        Some((ny as usize, nx as usize))
    } else {
        None
    }
}

pub fn direction_name(direction: usize) -> &'static str {
    DIRECTION_NAMES.get(direction).copied().unwrap_or("?")
}

#[inline]
pub const fn placement_action(row: usize, col: usize) -> usize {
    row * BOARD_SIZE + col
}

#[inline]
pub const fn placement_cell(action: usize) -> (usize, usize) {
    (action / BOARD_SIZE, action % BOARD_SIZE)
}

/// Semantic form of an action id once the phase is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Action {
    Place {
        row: usize,
        col: usize,
    },
    #[serde(rename_all = "camelCase")]
    Move {
        worker: usize,
        move_direction: usize,
        build_direction: usize,
    },
}

impl Action {
    pub fn from_id(action: usize, placement: bool) -> Option<Self> {
        if placement {
            if action >= PLACEMENT_ACTIONS {
                return None;
            }
            let (row, col) = placement_cell(action);
            return Some(Action::Place { row, col });
        }
        if action >= ACTION_SIZE {
            return None;
        }
        let (worker, move_direction, build_direction) = decode_action(action);
        Some(Action::Move {
            worker,
            move_direction,
            build_direction,
        })
    }

    pub fn id(&self) -> usize {
        match *self {
            Action::Place { row, col } => placement_action(row, col),
            Action::Move {
                worker,
                move_direction,
                build_direction,
            } => encode_action(worker, move_direction, build_direction),
        }
    }
}
