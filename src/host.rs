//! Request dispatcher that owns the engine instance on the worker side of the channel.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::cancel::{CancelReason, CancellationToken, SingleFlight};
use crate::engine::{Outcome, SantoriniEngine};
use crate::error::EngineError;
use crate::hooks::NoGods;
use crate::mcts::{MctsConfig, SantoriniMcts};
use crate::predictor::{resolve_now, Evaluator, HeuristicPredictor, Predictor, UniformPredictor};
use crate::protocol::{
    Command, EnginePreference, ErrorCode, Reply, Request, Response, ResponseError,
};

/// Builds the evaluator for an `init` request.
pub type PredictorFactory =
    Box<dyn Fn(EnginePreference) -> Result<Box<dyn Predictor>, EngineError> + Send>;

/// Factory covering the built-in evaluators. `Custom` needs a host-supplied factory.
pub fn builtin_predictor(preference: EnginePreference) -> Result<Box<dyn Predictor>, EngineError> {
    match preference {
        EnginePreference::Heuristic => Ok(Box::new(HeuristicPredictor::default())),
        EnginePreference::Uniform => Ok(Box::new(UniformPredictor)),
        EnginePreference::Custom => Err(EngineError::InvalidConfig(
            "no custom evaluator registered".into(),
        )),
    }
}

/// Owns at most one engine and answers [`Request`]s against it.
///
/// `E` is the leaf evaluator the factory builds on `init`. Native hosts use boxed
/// [`Predictor`]s and answer synchronously through [`handle`](Self::handle); the browser worker
/// awaits [`handle_async`](Self::handle_async) with an evaluator that may suspend.
pub struct EngineHost<E = Box<dyn Predictor>, F = PredictorFactory> {
    engine: Option<SantoriniEngine<E>>,
    flight: Arc<SingleFlight>,
    factory: F,
    seed: Option<u64>,
}

impl EngineHost {
    pub fn with_builtin_predictors(flight: Arc<SingleFlight>) -> Self {
        Self::new(flight, Box::new(builtin_predictor))
    }
}

impl<E, F> EngineHost<E, F>
where
    F: Fn(EnginePreference) -> Result<E, EngineError>,
{
    pub fn new(flight: Arc<SingleFlight>, factory: F) -> Self {
        Self {
            engine: None,
            flight,
            factory,
            seed: None,
        }
    }

    /// Seed applied to every engine created by a later `init`, for reproducible searches.
    pub fn set_seed(&mut self, seed: Option<u64>) {
        self.seed = seed;
    }

    pub fn flight(&self) -> &Arc<SingleFlight> {
        &self.flight
    }

    pub fn engine(&self) -> Option<&SantoriniEngine<E>> {
        self.engine.as_ref()
    }

    /// Release the request's flight and turn a caught panic into an internal error. The engine
    /// that panicked is dropped, so the next request must `init` again.
    fn settle(
        &mut self,
        id: u64,
        name: &'static str,
        evaluation: bool,
        outcome: std::thread::Result<Response>,
    ) -> Response {
        if evaluation {
            self.flight.finish(id);
        }
        match outcome {
            Ok(response) => {
                if let Some(error) = &response.error {
                    debug!("request {id} ({name}) failed: {error}");
                }
                response
            }
            Err(_) => {
                warn!("engine panicked while handling request {id} ({name}); dropping instance");
                self.engine = None;
                Response::err(
                    id,
                    ResponseError {
                        code: ErrorCode::Internal,
                        message: format!("engine panicked while handling {name}"),
                        rejection: None,
                    },
                )
            }
        }
    }

    /// Control requests only reach evaluations submitted before them; anything queued later was
    /// issued against the new engine or after the cancel and must run.
    fn init(
        &mut self,
        id: u64,
        preference: EnginePreference,
        config: Option<MctsConfig>,
    ) -> Result<Reply, EngineError> {
        let replaced = self.flight.cancel_before(id, CancelReason::EngineReplaced);
        if self.engine.take().is_some() {
            info!("replacing engine instance ({replaced} evaluation(s) cancelled)");
        }
        let config = config.unwrap_or_default();
        let evaluator = (self.factory)(preference)?;
        let mut mcts = SantoriniMcts::new(config, evaluator)?;
        if let Some(seed) = self.seed {
            mcts.set_seed(seed);
        }
        let engine = SantoriniEngine::new(mcts, Box::new(NoGods));
        let state = engine.state();
        self.engine = Some(engine);
        info!("engine initialised with {preference:?} evaluator");
        Ok(Reply::Initialized(state))
    }
}

impl<E, F> EngineHost<E, F>
where
    E: Evaluator,
    F: Fn(EnginePreference) -> Result<E, EngineError>,
{
    /// Handle one request, suspending wherever the evaluator does.
    pub async fn handle_async(&mut self, request: Request) -> Response {
        let id = request.id;
        let name = request.command.name();
        let evaluation = request.command.is_evaluation();
        let response = self.dispatch(id, request.command).await;
        self.settle(id, name, evaluation, Ok(response))
    }

    async fn dispatch(&mut self, id: u64, command: Command) -> Response {
        match command {
            Command::Init { preference, config } => match self.init(id, preference, config) {
                Ok(reply) => Response::ok(id, reply),
                Err(error) => Response::err(id, error),
            },
            Command::CancelEvaluation => {
                let cancelled = self.flight.cancel_before(id, CancelReason::Requested);
                debug!("cancelEvaluation flipped {cancelled} token(s)");
                Response::ok(id, Reply::Ack)
            }
            command => {
                let Some(engine) = self.engine.as_mut() else {
                    return Response::err(id, EngineError::NotInitialized);
                };
                let token = command.is_evaluation().then(|| self.flight.token_for(id));
                match run(engine, command, token).await {
                    Ok(Outcome::Completed(reply)) => Response::ok(id, reply),
                    Ok(Outcome::Cancelled(reason)) => {
                        if reason.is_error_for_caller() {
                            warn!("request {id} cancelled by engine replacement");
                        }
                        Response::cancelled(id, reason)
                    }
                    Err(error) => Response::err(id, error),
                }
            }
        }
    }
}

impl<E, F> EngineHost<E, F>
where
    E: Predictor,
    F: Fn(EnginePreference) -> Result<E, EngineError>,
{
    /// Handle one request to completion. Never panics across this boundary.
    pub fn handle(&mut self, request: Request) -> Response {
        let id = request.id;
        let name = request.command.name();
        let evaluation = request.command.is_evaluation();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            resolve_now(self.dispatch(id, request.command))
                .unwrap_or_else(|error| Response::err(id, EngineError::from(error)))
        }));
        self.settle(id, name, evaluation, outcome)
    }
}

async fn run<E: Evaluator>(
    engine: &mut SantoriniEngine<E>,
    command: Command,
    token: Option<CancellationToken>,
) -> Result<Outcome<Reply>, EngineError> {
    let token = token.unwrap_or_default();
    let reply = match command {
        Command::SyncSnapshot { snapshot } => {
            engine.import_snapshot(snapshot)?;
            Reply::State(engine.state())
        }
        Command::ExportSnapshot => Reply::Snapshot(engine.export_snapshot()),
        Command::CalculateEvaluation => match engine.evaluate_async(&token).await? {
            Outcome::Completed(evaluation) => Reply::Evaluation(evaluation),
            Outcome::Cancelled(reason) => return Ok(Outcome::Cancelled(reason)),
        },
        Command::GuessBestAction => match engine.guess_best_action_async(&token).await? {
            Outcome::Completed(best) => Reply::BestAction(best),
            Outcome::Cancelled(reason) => return Ok(Outcome::Cancelled(reason)),
        },
        Command::ListMovesWithAdv { limit, depth } => {
            match engine.list_moves_with_adv_async(limit, depth, &token).await? {
                Outcome::Completed(moves) => Reply::Moves(moves),
                Outcome::Cancelled(reason) => return Ok(Outcome::Cancelled(reason)),
            }
        }
        Command::GetHistorySnapshot => Reply::History(engine.history_view()),
        Command::GetHistoryLength => Reply::HistoryLength(engine.history_len()),
        Command::JumpToMoveIndex { index } => {
            engine.jump_to_move_index(index)?;
            Reply::Jumped {
                state: engine.state(),
                snapshot: engine.export_snapshot(),
            }
        }
        Command::EditCell { row, col, mode } => {
            engine.edit_cell(row, col, mode)?;
            Reply::State(engine.state())
        }
        Command::ChangeDifficulty { num_simulations } => {
            engine.change_difficulty(num_simulations)?;
            Reply::State(engine.state())
        }
        Command::Place { row, col } => {
            engine.place(row, col)?;
            Reply::State(engine.state())
        }
        Command::ApplyMove { action } => {
            engine.apply_move(action)?;
            Reply::State(engine.state())
        }
        Command::Undo => {
            engine.undo()?;
            Reply::State(engine.state())
        }
        Command::Redo => {
            engine.redo()?;
            Reply::State(engine.state())
        }
        // Handled before an engine is required.
        Command::Init { .. } | Command::CancelEvaluation => Reply::Ack,
    };
    Ok(Outcome::Completed(reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: u64, command: Command) -> Request {
        Request { id, command }
    }

    fn initialised_host() -> EngineHost {
        let mut host = EngineHost::with_builtin_predictors(Arc::new(SingleFlight::new()));
        host.set_seed(Some(5));
        let config = MctsConfig {
            num_simulations: 16,
            ..MctsConfig::default()
        };
        let response = host.handle(request(
            1,
            Command::Init {
                preference: EnginePreference::Heuristic,
                config: Some(config),
            },
        ));
        assert!(response.success, "{response:?}");
        host
    }

    #[test]
    fn commands_before_init_are_refused() {
        let mut host = EngineHost::with_builtin_predictors(Arc::new(SingleFlight::new()));
        let response = host.handle(request(9, Command::Undo));
        assert_eq!(response.id, 9);
        assert_eq!(
            response.error.map(|e| e.code),
            Some(ErrorCode::NotInitialized)
        );
        // Cancelling with nothing in flight is fine even without an engine.
        assert!(host.handle(request(10, Command::CancelEvaluation)).success);
    }

    #[test]
    fn custom_preference_without_factory_is_invalid_config() {
        let mut host = EngineHost::with_builtin_predictors(Arc::new(SingleFlight::new()));
        let response = host.handle(request(
            1,
            Command::Init {
                preference: EnginePreference::Custom,
                config: None,
            },
        ));
        assert_eq!(response.error.map(|e| e.code), Some(ErrorCode::InvalidConfig));
        assert!(host.engine().is_none());
    }

    #[test]
    fn rejected_move_reports_code_and_keeps_state() {
        let mut host = initialised_host();
        let before = host.handle(request(2, Command::ExportSnapshot));
        let response = host.handle(request(3, Command::ApplyMove { action: 0 }));
        assert!(!response.success);
        assert_eq!(response.error.map(|e| e.code), Some(ErrorCode::WrongPhase));
        let after = host.handle(request(4, Command::ExportSnapshot));
        assert_eq!(before.result, after.result);
    }

    #[test]
    fn unregistered_evaluation_comes_back_superseded() {
        let mut host = initialised_host();
        let response = host.handle(request(5, Command::CalculateEvaluation));
        assert!(response.success);
        assert_eq!(
            response.result,
            Some(Reply::Cancelled {
                reason: CancelReason::Superseded
            })
        );
    }

    #[test]
    fn registered_evaluation_completes_and_is_released() {
        let mut host = initialised_host();
        open(&mut host);
        host.flight().begin(6);
        let response = host.handle(request(6, Command::GuessBestAction));
        let Some(Reply::BestAction(best)) = response.result else {
            panic!("expected a best action, got {response:?}");
        };
        assert!(best.action.is_some());
        assert!(!host.flight().is_active());
    }

    #[test]
    fn reinit_resets_the_game() {
        let mut host = initialised_host();
        assert!(host.handle(request(2, Command::Place { row: 2, col: 2 })).success);
        let response = host.handle(request(
            3,
            Command::Init {
                preference: EnginePreference::Uniform,
                config: None,
            },
        ));
        let Some(Reply::Initialized(state)) = response.result else {
            panic!("expected initialised state");
        };
        assert_eq!(state.history_length, 0);
        assert_eq!(state.valid_actions.len(), 25);
    }

    fn open(host: &mut EngineHost) {
        for (row, col) in [(0, 0), (0, 4), (4, 0), (4, 4)] {
            assert!(host.handle(request(2, Command::Place { row, col })).success);
        }
    }

    #[test]
    fn cancel_spares_evaluations_submitted_after_it() {
        let mut host = initialised_host();
        open(&mut host);
        let earlier = host.flight().begin(7);
        let later = host.flight().begin(9);

        assert!(host.handle(request(8, Command::CancelEvaluation)).success);
        // `begin(9)` already superseded 7; the cancel must leave 9 alone.
        assert_eq!(earlier.reason(), Some(CancelReason::Superseded));
        assert!(!later.is_cancelled());

        let response = host.handle(request(9, Command::CalculateEvaluation));
        assert!(
            matches!(response.result, Some(Reply::Evaluation(_))),
            "{response:?}"
        );
    }

    #[test]
    fn reinit_only_replaces_evaluations_submitted_before_it() {
        let mut host = initialised_host();
        let uniform = || Command::Init {
            preference: EnginePreference::Uniform,
            config: None,
        };

        let running = host.flight().begin(3);
        assert!(host.handle(request(4, uniform())).success);
        assert_eq!(running.reason(), Some(CancelReason::EngineReplaced));
        let response = host.handle(request(3, Command::CalculateEvaluation));
        assert_eq!(
            response.error.map(|e| e.code),
            Some(ErrorCode::EvaluationCancelled)
        );

        let queued = host.flight().begin(6);
        assert!(host.handle(request(5, uniform())).success);
        assert!(!queued.is_cancelled());
        let response = host.handle(request(6, Command::GuessBestAction));
        assert!(
            matches!(response.result, Some(Reply::BestAction(_))),
            "{response:?}"
        );
    }
}
