use std::future::Future;
use std::pin::pin;
use std::task::{Context, Poll, Waker};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::board::{worker_owner, BoardState, DOME, STATE_SIZE, WINNING_LEVEL};
use crate::codec::{decode_action, step, ACTION_SIZE, BOARD_SIZE};

/// Shape returned by a leaf evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkPrediction {
    /// Log-probabilities or raw policy scores for each of the 162 actions.
    pub pi: Vec<f32>,
    /// Scalar evaluation in [-1.0, 1.0] from the perspective of the side-to-move.
    pub v: f32,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PredictorError {
    #[error("predictor returned {0} policy entries, expected at least {ACTION_SIZE}")]
    ShortPolicy(usize),
    #[error("predictor returned a non-finite value")]
    NonFinite,
    #[error("predictor failed: {0}")]
    Failed(String),
    #[error("evaluator suspended a synchronous search")]
    Suspended,
}

/// Policy/value function scoring unexpanded search nodes.
///
/// `board` is the canonical 75-entry tensor (side to move is always player 0) and `valid` the
/// legal-action mask for that side.
pub trait Predictor: Send {
    fn predict(
        &mut self,
        board: &[i8; STATE_SIZE],
        valid: &[bool; ACTION_SIZE],
    ) -> Result<NetworkPrediction, PredictorError>;
}

impl<P: Predictor + ?Sized> Predictor for Box<P> {
    fn predict(
        &mut self,
        board: &[i8; STATE_SIZE],
        valid: &[bool; ACTION_SIZE],
    ) -> Result<NetworkPrediction, PredictorError> {
        (**self).predict(board, valid)
    }
}

/// Leaf evaluator as seen by the search. Every [`Predictor`] is one; evaluators that answer
/// later (a browser model returning a Promise) implement it directly.
#[allow(async_fn_in_trait)]
pub trait Evaluator {
    async fn evaluate(
        &mut self,
        board: &[i8; STATE_SIZE],
        valid: &[bool; ACTION_SIZE],
    ) -> Result<NetworkPrediction, PredictorError>;

    /// Awaited between simulation batches, right before the cancellation token is polled.
    async fn yield_now(&mut self) {}
}

impl<P: Predictor + ?Sized> Evaluator for P {
    async fn evaluate(
        &mut self,
        board: &[i8; STATE_SIZE],
        valid: &[bool; ACTION_SIZE],
    ) -> Result<NetworkPrediction, PredictorError> {
        self.predict(board, valid)
    }
}

/// Run a future whose evaluator never suspends. A synchronous predictor answers every await
/// immediately, so one poll drives the search to completion.
pub(crate) fn resolve_now<F: Future>(future: F) -> Result<F::Output, PredictorError> {
    let mut future = pin!(future);
    match future.as_mut().poll(&mut Context::from_waker(Waker::noop())) {
        Poll::Ready(output) => Ok(output),
        Poll::Pending => Err(PredictorError::Suspended),
    }
}

/// Flat policy, neutral value.
#[derive(Debug, Default, Clone, Copy)]
pub struct UniformPredictor;

impl Predictor for UniformPredictor {
    fn predict(
        &mut self,
        _board: &[i8; STATE_SIZE],
        _valid: &[bool; ACTION_SIZE],
    ) -> Result<NetworkPrediction, PredictorError> {
        Ok(NetworkPrediction {
            pi: vec![0.0; ACTION_SIZE],
            v: 0.0,
        })
    }
}

/// Hand-tuned evaluator: prefers climbing, strongly prefers stepping onto level 3, and values a
/// position by the height difference between the two sides' workers.
#[derive(Debug, Clone, Copy)]
pub struct HeuristicPredictor {
    pub climb_weight: f32,
    pub win_bonus: f32,
}

impl Default for HeuristicPredictor {
    fn default() -> Self {
        Self {
            climb_weight: 1.0,
            win_bonus: 6.0,
        }
    }
}

impl Predictor for HeuristicPredictor {
    fn predict(
        &mut self,
        tensor: &[i8; STATE_SIZE],
        valid: &[bool; ACTION_SIZE],
    ) -> Result<NetworkPrediction, PredictorError> {
        let board = BoardState::from_bytes(tensor)
            .map_err(|err| PredictorError::Failed(err.to_string()))?;
        let mut pi = vec![0.0f32; ACTION_SIZE];
        if board.next_placement().is_none() {
            for (action, _) in valid.iter().enumerate().filter(|(_, &flag)| flag) {
                let (worker, move_direction, _) = decode_action(action);
                let Some(origin) = board.find_worker(worker as i8 + 1) else {
                    continue;
                };
                let Some(target) = step(origin, move_direction) else {
                    continue;
                };
                let level = board.height(target.0, target.1);
                let climb = level - board.height(origin.0, origin.1);
                pi[action] = self.climb_weight * f32::from(climb.max(0) + level);
                if level == WINNING_LEVEL {
                    pi[action] += self.win_bonus;
                }
            }
        }

        let mut balance = 0.0f32;
        for y in 0..BOARD_SIZE {
            for x in 0..BOARD_SIZE {
                let level = board.height(y, x).min(DOME - 1) as f32;
                match worker_owner(board.occupant(y, x)) {
                    Some(0) => balance += level,
                    Some(_) => balance -= level,
                    None => {}
                }
            }
        }
        Ok(NetworkPrediction {
            pi,
            v: (balance / 6.0).tanh(),
        })
    }
}
