//! Move log entries and the derived, display-only history view.
//!
//! Nothing here touches the live position: every view is rebuilt from the recorded action ids and
//! the `board_before` snapshots, so it can be recomputed at any time.

use serde::{Deserialize, Serialize};

use crate::board::{worker_id, BoardState, WINNING_LEVEL};
use crate::codec::{
    apply_direction, decode_action, direction_name, placement_cell, Action, NO_BUILD,
};

/// One committed transition. `action` is `None` for legacy entries that only carry text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub player: usize,
    #[serde(default)]
    pub action: Option<usize>,
    #[serde(default)]
    pub board_before: BoardState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryView {
    pub index: usize,
    pub player: usize,
    pub action: Option<usize>,
    /// `action` decoded against the phase it was played in.
    pub detail: Option<Action>,
    pub description: String,
    pub from: Option<(usize, usize)>,
    pub to: Option<(usize, usize)>,
    pub build: Option<(usize, usize)>,
    pub board_before: BoardState,
    pub board_after: BoardState,
}

/// Cells touched by one action, recovered from the id and the board it was played on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActionCells {
    pub from: Option<(usize, usize)>,
    pub to: Option<(usize, usize)>,
    pub build: Option<(usize, usize)>,
    pub wins: bool,
}

/// Column letter plus 1-based row, e.g. `(0, 2)` is `C1`.
pub fn cell_name(cell: (usize, usize)) -> String {
    format!("{}{}", (b'A' + cell.1 as u8) as char, cell.0 + 1)
}

fn on_board(cell: (i8, i8)) -> Option<(usize, usize)> {
    let size = crate::codec::BOARD_SIZE as i8;
    ((0..size).contains(&cell.0) && (0..size).contains(&cell.1))
        .then(|| (cell.0 as usize, cell.1 as usize))
}

pub fn action_cells(board: &BoardState, player: usize, action: usize) -> ActionCells {
    if board.next_placement().is_some() {
        return ActionCells {
            to: Some(placement_cell(action)),
            ..ActionCells::default()
        };
    }
    let (worker, move_direction, build_direction) = decode_action(action);
    let Some(from) = board.find_worker(worker_id(player, worker)) else {
        return ActionCells::default();
    };
    let to = on_board(apply_direction(from.0 as i8, from.1 as i8, move_direction));
    let wins = to.is_some_and(|(y, x)| board.height(y, x) == WINNING_LEVEL);
    let build = match to {
        Some((y, x)) if !wins && build_direction != NO_BUILD => {
            on_board(apply_direction(y as i8, x as i8, build_direction))
        }
        _ => None,
    };
    ActionCells {
        from: Some(from),
        to,
        build,
        wins,
    }
}

/// Human-readable text for `action` played by `player` on `board`.
pub fn describe_action(board: &BoardState, player: usize, action: usize) -> String {
    let who = format!("Player {}", player + 1);
    if let Some((_, worker)) = board.next_placement() {
        let (row, col) = placement_cell(action);
        return format!(
            "{who} places worker {} on {}",
            worker.unsigned_abs(),
            cell_name((row, col))
        );
    }
    let (worker, move_direction, _) = decode_action(action);
    let cells = action_cells(board, player, action);
    let (Some(from), Some(to)) = (cells.from, cells.to) else {
        return format!("{who} plays action {action}");
    };
    let mut text = format!(
        "{who} moves worker {} {} {} → {}",
        worker + 1,
        direction_name(move_direction),
        cell_name(from),
        cell_name(to)
    );
    if cells.wins {
        text.push_str(" and wins");
    } else if let Some(build) = cells.build {
        text.push_str(&format!(", builds on {}", cell_name(build)));
    }
    text
}

/// Build the display history. `current` is the live board and serves as the "after" snapshot of
/// the last entry.
pub fn build_history(entries: &[HistoryEntry], current: &BoardState) -> Vec<HistoryView> {
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let board_after = entries
                .get(index + 1)
                .map(|next| next.board_before)
                .unwrap_or(*current);
            let (description, cells) = match entry.action {
                Some(action) => (
                    describe_action(&entry.board_before, entry.player, action),
                    action_cells(&entry.board_before, entry.player, action),
                ),
                None => (
                    entry
                        .description
                        .clone()
                        .unwrap_or_else(|| "Initial position".to_string()),
                    ActionCells::default(),
                ),
            };
            HistoryView {
                index,
                player: entry.player,
                action: entry.action,
                detail: entry.action.and_then(|action| {
                    Action::from_id(action, entry.board_before.next_placement().is_some())
                }),
                description,
                from: cells.from,
                to: cells.to,
                build: cells.build,
                board_before: entry.board_before,
                board_after,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::tests::opened_board;
    use crate::codec::{encode_action, encode_direction, placement_action};

    #[test]
    fn placement_and_move_descriptions() {
        let empty = BoardState::new();
        assert_eq!(
            describe_action(&empty, 0, placement_action(2, 2)),
            "Player 1 places worker 1 on C3"
        );

        let board = opened_board();
        let south = encode_direction(0, 0, 1, 0).expect("adjacent");
        let east = encode_direction(1, 0, 1, 1).expect("adjacent");
        let action = encode_action(0, south, east);
        assert_eq!(
            describe_action(&board, 0, action),
            "Player 1 moves worker 1 S A1 → A2, builds on B2"
        );
        let cells = action_cells(&board, 0, action);
        assert_eq!(cells.from, Some((0, 0)));
        assert_eq!(cells.to, Some((1, 0)));
        assert_eq!(cells.build, Some((1, 1)));
    }

    #[test]
    fn winning_move_reports_no_build() {
        let mut board = opened_board();
        board.set_height(3, 0, 1);
        board.set_height(4, 0, 2);
        board.set_height(3, 1, 3);
        let north_east = encode_direction(4, 0, 3, 1).expect("adjacent");
        let north = encode_direction(3, 1, 2, 1).expect("adjacent");
        let action = encode_action(0, north_east, north);
        let cells = action_cells(&board, 1, action);
        assert!(cells.wins);
        assert_eq!(cells.build, None);
        assert!(describe_action(&board, 1, action).ends_with("and wins"));
    }

    #[test]
    fn legacy_entries_fall_back_to_text() {
        let board = opened_board();
        let entries = vec![
            HistoryEntry {
                player: 0,
                action: None,
                board_before: board,
                description: Some("Imported from notebook".into()),
            },
            HistoryEntry {
                player: 0,
                action: None,
                board_before: board,
                description: None,
            },
        ];
        let views = build_history(&entries, &board);
        assert_eq!(views[0].description, "Imported from notebook");
        assert_eq!(views[1].description, "Initial position");
        assert_eq!(views[1].from, None);
        assert_eq!(views[1].detail, None);
    }

    #[test]
    fn after_snapshot_comes_from_next_entry() {
        let first = BoardState::new();
        let mut second = first;
        second.make_move(placement_action(0, 0), 0).expect("placement");
        let mut current = second;
        current.make_move(placement_action(0, 1), 0).expect("placement");
        let entries = vec![
            HistoryEntry {
                player: 0,
                action: Some(placement_action(0, 0)),
                board_before: first,
                description: None,
            },
            HistoryEntry {
                player: 0,
                action: Some(placement_action(0, 1)),
                board_before: second,
                description: None,
            },
        ];
        let views = build_history(&entries, &current);
        assert_eq!(views[0].board_after, second);
        assert_eq!(views[1].board_after, current);
        assert_eq!(views[1].description, "Player 1 places worker 2 on B1");
        assert_eq!(views[1].detail, Some(Action::Place { row: 0, col: 1 }));
    }

    #[test]
    fn movement_entries_carry_the_decoded_action() {
        let board = opened_board();
        let south = encode_direction(0, 0, 1, 0).expect("adjacent");
        let east = encode_direction(1, 0, 1, 1).expect("adjacent");
        let action = encode_action(0, south, east);
        let mut current = board;
        current.make_move(action, 0).expect("legal");
        let entries = vec![HistoryEntry {
            player: 0,
            action: Some(action),
            board_before: board,
            description: None,
        }];
        let views = build_history(&entries, &current);
        assert_eq!(
            views[0].detail,
            Some(Action::Move {
                worker: 0,
                move_direction: south,
                build_direction: east,
            })
        );
        assert_eq!(views[0].detail.map(|detail| detail.id()), Some(action));
    }
}
