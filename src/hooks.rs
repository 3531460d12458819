//! Transition callbacks injected into the engine.
//!
//! Variants with god powers hook the same three points; the base game only needs the defaults.

use crate::board::Position;
use crate::error::Rejection;

pub trait GameHooks: Send {
    /// Runs once after a fresh or imported position has been installed.
    fn post_init_game(&self, _position: &mut Position) {}

    /// Runs before a validated action is committed. Returning an error vetoes the transition and
    /// leaves the position untouched.
    fn pre_move(&self, _position: &Position, _action: usize) -> Result<(), Rejection> {
        Ok(())
    }

    /// Runs after the action has been applied, before the validity mask is recomputed.
    fn post_move(&self, _position: &mut Position, _action: usize) {}
}

/// Plain Santorini without god cards.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGods;

impl GameHooks for NoGods {}
