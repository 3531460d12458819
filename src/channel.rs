//! `EngineChannel`: message-passing front end for an engine running on its own thread.
//!
//! - every request gets a fresh correlation id and a [`Ticket`] that resolves with its response
//! - responses are routed by id, so out-of-order replies land on the right ticket
//! - evaluation requests register with a shared [`SingleFlight`] before they are queued; a newer
//!   evaluation, `cancel_evaluation` or `init` flips the older tokens without waiting for the queue

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use hashbrown::HashMap;
use log::{debug, warn};
use thiserror::Error;

use crate::cancel::{CancelReason, SingleFlight};
use crate::engine::EditMode;
use crate::error::Rejection;
use crate::host::{builtin_predictor, EngineHost, PredictorFactory};
use crate::mcts::MctsConfig;
use crate::protocol::{Command, EnginePreference, Reply, Request, Response, ResponseError};
use crate::snapshot::Snapshot;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] io::Error),
    #[error("engine channel disconnected")]
    Disconnected,
    #[error("request timed out")]
    Timeout,
    #[error("request rejected: {0}")]
    Rejected(Rejection),
    #[error("engine error: {0}")]
    Remote(ResponseError),
}

/// Split a response into its reply or a typed error; state-machine refusals keep their
/// [`Rejection`].
pub fn into_result(response: Response) -> Result<Reply, ChannelError> {
    if response.success {
        return Ok(response.result.unwrap_or(Reply::Ack));
    }
    match response.error {
        Some(ResponseError {
            rejection: Some(rejection),
            ..
        }) => Err(ChannelError::Rejected(rejection)),
        Some(error) => Err(ChannelError::Remote(error)),
        None => Err(ChannelError::Disconnected),
    }
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// First correlation id handed out (useful for tests).
    pub request_id_start: u64,
    /// RNG seed for every engine created through `init`.
    pub seed: Option<u64>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            request_id_start: 1,
            seed: None,
        }
    }
}

type ReplySender = mpsc::Sender<Result<Reply, ChannelError>>;

#[derive(Debug, Default)]
struct PendingTable {
    entries: Mutex<HashMap<u64, ReplySender>>,
}

impl PendingTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, ReplySender>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, request_id: u64, tx: ReplySender) {
        self.lock().insert(request_id, tx);
    }

    /// Deliver a response to its ticket. Unknown or already-resolved ids are dropped.
    fn resolve(&self, response: Response) -> bool {
        let Some(tx) = self.lock().remove(&response.id) else {
            warn!("dropping response for unknown request {}", response.id);
            return false;
        };
        // The ticket may have been dropped by its owner; nothing to deliver then.
        let _ = tx.send(into_result(response));
        true
    }

    fn fail_all(&self) {
        for (_, tx) in self.lock().drain() {
            let _ = tx.send(Err(ChannelError::Disconnected));
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Handle for one submitted request.
#[derive(Debug)]
pub struct Ticket {
    pub request_id: u64,
    rx: mpsc::Receiver<Result<Reply, ChannelError>>,
}

impl Ticket {
    pub fn recv(&self) -> Result<Reply, ChannelError> {
        match self.rx.recv() {
            Ok(r) => r,
            Err(_) => Err(ChannelError::Disconnected),
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Reply, ChannelError> {
        match self.rx.recv_timeout(timeout) {
            Ok(r) => r,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(ChannelError::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ChannelError::Disconnected),
        }
    }

    pub fn try_recv(&self) -> Result<Option<Reply>, ChannelError> {
        match self.rx.try_recv() {
            Ok(r) => Ok(Some(r?)),
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => Err(ChannelError::Disconnected),
        }
    }
}

pub struct EngineChannel {
    next_request_id: AtomicU64,
    pending: Arc<PendingTable>,
    flight: Arc<SingleFlight>,
    outbound: Option<mpsc::Sender<Request>>,
    worker: Option<JoinHandle<()>>,
    router: Option<JoinHandle<()>>,
}

impl EngineChannel {
    /// Start an engine thread with the built-in evaluators.
    pub fn spawn_builtin() -> Result<Self, ChannelError> {
        Self::spawn(Box::new(builtin_predictor), ChannelOptions::default())
    }

    pub fn spawn(factory: PredictorFactory, opts: ChannelOptions) -> Result<Self, ChannelError> {
        let flight = Arc::new(SingleFlight::new());
        let pending = Arc::new(PendingTable::default());
        let (request_tx, request_rx) = mpsc::channel::<Request>();
        let (response_tx, response_rx) = mpsc::channel::<Response>();

        let mut host = EngineHost::new(Arc::clone(&flight), factory);
        host.set_seed(opts.seed);
        let worker = thread::Builder::new()
            .name("santorini-engine".to_string())
            .spawn(move || {
                while let Ok(request) = request_rx.recv() {
                    let response = host.handle(request);
                    if response_tx.send(response).is_err() {
                        break;
                    }
                }
                debug!("engine thread exiting");
            })?;

        let router_pending = Arc::clone(&pending);
        let router = thread::Builder::new()
            .name("santorini-router".to_string())
            .spawn(move || {
                while let Ok(response) = response_rx.recv() {
                    router_pending.resolve(response);
                }
                router_pending.fail_all();
            })?;

        Ok(Self {
            next_request_id: AtomicU64::new(opts.request_id_start),
            pending,
            flight,
            outbound: Some(request_tx),
            worker: Some(worker),
            router: Some(router),
        })
    }

    /// Queue `command` and return the ticket its response will arrive on.
    pub fn submit(&self, command: Command) -> Result<Ticket, ChannelError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        self.pending.insert(request_id, tx);
        if command.is_evaluation() {
            self.flight.begin(request_id);
        }
        let sent = self
            .outbound
            .as_ref()
            .ok_or(ChannelError::Disconnected)
            .and_then(|outbound| {
                outbound
                    .send(Request {
                        id: request_id,
                        command,
                    })
                    .map_err(|_| ChannelError::Disconnected)
            });
        if let Err(error) = sent {
            self.pending.lock().remove(&request_id);
            self.flight.finish(request_id);
            return Err(error);
        }
        Ok(Ticket { request_id, rx })
    }

    /// Submit and block until the response arrives.
    pub fn request(&self, command: Command) -> Result<Reply, ChannelError> {
        self.submit(command)?.recv()
    }

    /// Replace the engine. Running evaluations stop with an `evaluation-cancelled` error.
    pub fn init(
        &self,
        preference: EnginePreference,
        config: Option<MctsConfig>,
    ) -> Result<Ticket, ChannelError> {
        self.flight.cancel_all(CancelReason::EngineReplaced);
        self.submit(Command::Init { preference, config })
    }

    pub fn calculate_evaluation(&self) -> Result<Ticket, ChannelError> {
        self.submit(Command::CalculateEvaluation)
    }

    pub fn guess_best_action(&self) -> Result<Ticket, ChannelError> {
        self.submit(Command::GuessBestAction)
    }

    pub fn list_moves_with_adv(&self, limit: usize, depth: u32) -> Result<Ticket, ChannelError> {
        self.submit(Command::ListMovesWithAdv { limit, depth })
    }

    /// Cancel the live evaluation, if any. Safe to call repeatedly or with nothing in flight.
    pub fn cancel_evaluation(&self) -> Result<Ticket, ChannelError> {
        let cancelled = self.flight.cancel_all(CancelReason::Requested);
        debug!("cancel requested, {cancelled} evaluation(s) flagged");
        self.submit(Command::CancelEvaluation)
    }

    pub fn sync_snapshot(&self, snapshot: Snapshot) -> Result<Ticket, ChannelError> {
        self.submit(Command::SyncSnapshot { snapshot })
    }

    pub fn export_snapshot(&self) -> Result<Ticket, ChannelError> {
        self.submit(Command::ExportSnapshot)
    }

    pub fn get_history_snapshot(&self) -> Result<Ticket, ChannelError> {
        self.submit(Command::GetHistorySnapshot)
    }

    pub fn get_history_length(&self) -> Result<Ticket, ChannelError> {
        self.submit(Command::GetHistoryLength)
    }

    pub fn jump_to_move_index(&self, index: usize) -> Result<Ticket, ChannelError> {
        self.submit(Command::JumpToMoveIndex { index })
    }

    /// Edit a square. Refused while an evaluation is registered, since the search works from the
    /// position as it was when the request was queued.
    pub fn edit_cell(
        &self,
        row: usize,
        col: usize,
        mode: EditMode,
    ) -> Result<Ticket, ChannelError> {
        if self.flight.is_active() {
            return Err(ChannelError::Rejected(Rejection::SearchInFlight));
        }
        self.submit(Command::EditCell { row, col, mode })
    }

    pub fn change_difficulty(&self, num_simulations: u32) -> Result<Ticket, ChannelError> {
        self.submit(Command::ChangeDifficulty { num_simulations })
    }

    pub fn place(&self, row: usize, col: usize) -> Result<Ticket, ChannelError> {
        self.submit(Command::Place { row, col })
    }

    pub fn apply_move(&self, action: usize) -> Result<Ticket, ChannelError> {
        self.submit(Command::ApplyMove { action })
    }

    pub fn undo(&self) -> Result<Ticket, ChannelError> {
        self.submit(Command::Undo)
    }

    pub fn redo(&self) -> Result<Ticket, ChannelError> {
        self.submit(Command::Redo)
    }

    pub fn evaluation_in_flight(&self) -> bool {
        self.flight.is_active()
    }

    /// Requests submitted but not yet answered.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for EngineChannel {
    fn drop(&mut self) {
        self.flight.cancel_all(CancelReason::EngineReplaced);
        self.outbound.take();
        for handle in [self.worker.take(), self.router.take()].into_iter().flatten() {
            if handle.join().is_err() {
                warn!("engine channel thread panicked during shutdown");
            }
        }
    }
}
