//! Browser bindings: a single `handleMessage` entry point wrapping [`EngineHost`].
//!
//! Values crossing from JavaScript go through [`ForeignValue`] once and are converted to native
//! types there; nothing past this module sees a `JsValue`. Searches await the JS predictor and
//! yield to the event loop between batches, so `cancelEvaluation` can land mid-search.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use js_sys::Promise;
use log::{debug, Level, LevelFilter, Log, Metadata, Record};
use serde::de::DeserializeOwned;
use serde::Serialize;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::{future_to_promise, JsFuture};

use crate::board::STATE_SIZE;
use crate::cancel::{CancelReason, SingleFlight};
use crate::codec::ACTION_SIZE;
use crate::error::EngineError;
use crate::host::{builtin_predictor, EngineHost};
use crate::predictor::{Evaluator, NetworkPrediction, Predictor, PredictorError};
use crate::protocol::{
    Command, EnginePreference, ErrorCode, Reply, Request, Response, ResponseError,
};

struct ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = JsValue::from_str(&format!("[{}] {}", record.target(), record.args()));
        match record.level() {
            Level::Error => web_sys::console::error_1(&line),
            Level::Warn => web_sys::console::warn_1(&line),
            Level::Info => web_sys::console::info_1(&line),
            Level::Debug | Level::Trace => web_sys::console::debug_1(&line),
        }
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger;

/// Install a panic hook sending Rust panics to the browser console and route `log` records there.
/// The panic hook is only compiled in when the `console_error_panic_hook` feature is enabled
/// (default). Safe to call more than once.
#[wasm_bindgen(js_name = initPanicHook)]
pub fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}

/// Raise console verbosity to `debug` for search and dispatch tracing.
#[wasm_bindgen(js_name = setVerboseLogging)]
pub fn set_verbose_logging(verbose: bool) {
    log::set_max_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
}

/// Flattened board tensor length (5×5×3 = 75 entries).
#[wasm_bindgen(js_name = stateSize)]
pub fn state_size() -> usize {
    STATE_SIZE
}

/// Number of action ids in the no-gods ruleset (162).
#[wasm_bindgen(js_name = actionSize)]
pub fn action_size() -> usize {
    ACTION_SIZE
}

/// A value handed over by JavaScript, classified before it is trusted.
enum ForeignValue {
    Missing,
    Object(JsValue),
}

impl ForeignValue {
    fn from_js(value: JsValue) -> Self {
        if value.is_undefined() || value.is_null() {
            ForeignValue::Missing
        } else {
            ForeignValue::Object(value)
        }
    }

    fn to_native<T: DeserializeOwned>(self, what: &str) -> Result<T, String> {
        match self {
            ForeignValue::Missing => Err(format!("{what} is missing")),
            ForeignValue::Object(value) => {
                serde_wasm_bindgen::from_value(value).map_err(|err| format!("bad {what}: {err}"))
            }
        }
    }
}

fn to_js<T: Serialize>(value: &T) -> JsValue {
    let serializer = serde_wasm_bindgen::Serializer::json_compatible();
    value
        .serialize(&serializer)
        .unwrap_or_else(|err| JsValue::from_str(&format!("serialisation failed: {err}")))
}

/// Evaluator backed by a JavaScript function `(board: Int8Array, mask: Uint8Array) =>
/// { pi: number[], v: number }`, or a Promise of that shape.
#[derive(Clone)]
struct JsPredictor {
    function: js_sys::Function,
}

impl JsPredictor {
    async fn predict(
        &self,
        board: &[i8; STATE_SIZE],
        valid: &[bool; ACTION_SIZE],
    ) -> Result<NetworkPrediction, PredictorError> {
        let mask: Vec<u8> = valid.iter().map(|&flag| u8::from(flag)).collect();
        let board_js = JsValue::from(js_sys::Int8Array::from(&board[..]));
        let mask_js = JsValue::from(js_sys::Uint8Array::from(&mask[..]));
        let mut value = self
            .function
            .call2(&JsValue::NULL, &board_js, &mask_js)
            .map_err(js_failure)?;
        if let Some(promise) = value.dyn_ref::<Promise>() {
            value = JsFuture::from(promise.clone()).await.map_err(js_failure)?;
        }
        ForeignValue::from_js(value)
            .to_native("prediction")
            .map_err(PredictorError::Failed)
    }
}

fn js_failure(err: JsValue) -> PredictorError {
    PredictorError::Failed(format!("{err:?}"))
}

/// Resolve on the next macrotask. Worker messages are macrotasks too, so a queued
/// `cancelEvaluation` is delivered before the search continues.
async fn next_macrotask() {
    let promise = Promise::new(&mut |resolve, _reject| {
        let global = js_sys::global();
        let scheduled = js_sys::Reflect::get(&global, &JsValue::from_str("setTimeout"))
            .ok()
            .and_then(|value| value.dyn_into::<js_sys::Function>().ok())
            .is_some_and(|set_timeout| {
                set_timeout
                    .call2(&global, &resolve, &JsValue::from(0))
                    .is_ok()
            });
        if !scheduled {
            let _ = resolve.call0(&JsValue::NULL);
        }
    });
    let _ = JsFuture::from(promise).await;
}

enum WasmEvaluator {
    Builtin(Box<dyn Predictor>),
    Js(JsPredictor),
}

impl Evaluator for WasmEvaluator {
    async fn evaluate(
        &mut self,
        board: &[i8; STATE_SIZE],
        valid: &[bool; ACTION_SIZE],
    ) -> Result<NetworkPrediction, PredictorError> {
        match self {
            WasmEvaluator::Builtin(predictor) => predictor.predict(board, valid),
            WasmEvaluator::Js(predictor) => predictor.predict(board, valid).await,
        }
    }

    async fn yield_now(&mut self) {
        next_macrotask().await;
    }
}

type WasmFactory = Box<dyn Fn(EnginePreference) -> Result<WasmEvaluator, EngineError>>;

/// One engine per worker. `cancelEvaluation` is answered on arrival; every other request waits
/// for the one before it, so requests still run in arrival order while a search is parked on
/// the event loop.
#[wasm_bindgen]
pub struct WasmEngineWorker {
    flight: Arc<SingleFlight>,
    host: Rc<RefCell<EngineHost<WasmEvaluator, WasmFactory>>>,
    /// Promise of the most recently queued request.
    tail: RefCell<Promise>,
}

#[wasm_bindgen]
impl WasmEngineWorker {
    /// `predictor` backs the `custom` engine preference; omit it to use the built-in evaluators.
    #[wasm_bindgen(constructor)]
    pub fn new(predictor: Option<js_sys::Function>) -> WasmEngineWorker {
        let flight = Arc::new(SingleFlight::new());
        let factory: WasmFactory = Box::new(move |preference| match (preference, &predictor) {
            (EnginePreference::Custom, Some(function)) => Ok(WasmEvaluator::Js(JsPredictor {
                function: function.clone(),
            })),
            (preference, _) => builtin_predictor(preference).map(WasmEvaluator::Builtin),
        });
        WasmEngineWorker {
            host: Rc::new(RefCell::new(EngineHost::new(Arc::clone(&flight), factory))),
            flight,
            tail: RefCell::new(Promise::resolve(&JsValue::UNDEFINED)),
        }
    }

    /// Seed for engines created by later `init` requests. Refused while a request is running.
    #[wasm_bindgen(js_name = setSeed)]
    pub fn set_seed(&self, seed: Option<u64>) -> Result<(), JsValue> {
        let mut host = self
            .host
            .try_borrow_mut()
            .map_err(|_| JsValue::from_str("engine is busy"))?;
        host.set_seed(seed);
        Ok(())
    }

    /// Handle one `{ id, command }` message. Resolves with the `{ id, success, result | error }`
    /// response; never rejects.
    #[wasm_bindgen(js_name = handleMessage)]
    pub fn handle_message(&self, message: JsValue) -> Promise {
        let id = js_sys::Reflect::get(&message, &JsValue::from_str("id"))
            .ok()
            .and_then(|value| value.as_f64())
            .map_or(0, |value| value as u64);
        let request: Request = match ForeignValue::from_js(message).to_native("request") {
            Ok(request) => request,
            Err(message) => {
                let response = Response::err(
                    id,
                    ResponseError {
                        code: ErrorCode::ChannelError,
                        message,
                        rejection: None,
                    },
                );
                return Promise::resolve(&to_js(&response));
            }
        };

        match &request.command {
            Command::CancelEvaluation => {
                let cancelled = self.flight.cancel_all(CancelReason::Requested);
                debug!("cancelEvaluation flipped {cancelled} token(s)");
                return Promise::resolve(&to_js(&Response::ok(request.id, Reply::Ack)));
            }
            Command::Init { .. } => {
                self.flight.cancel_all(CancelReason::EngineReplaced);
            }
            command if command.is_evaluation() => {
                self.flight.begin(request.id);
            }
            _ => {}
        }

        let host = Rc::clone(&self.host);
        let previous = self.tail.borrow().clone();
        let promise = future_to_promise(async move {
            let _ = JsFuture::from(previous).await;
            Ok(to_js(&run_queued(&host, request).await))
        });
        self.tail.replace(promise.clone());
        promise
    }
}

// Requests are chained on `tail`, so at most one borrow of the host is alive at a time.
#[allow(clippy::await_holding_refcell_ref)]
async fn run_queued(
    host: &RefCell<EngineHost<WasmEvaluator, WasmFactory>>,
    request: Request,
) -> Response {
    let id = request.id;
    match host.try_borrow_mut() {
        Ok(mut host) => host.handle_async(request).await,
        Err(_) => Response::err(
            id,
            ResponseError {
                code: ErrorCode::Internal,
                message: "engine is busy".into(),
                rejection: None,
            },
        ),
    }
}

impl Default for WasmEngineWorker {
    fn default() -> Self {
        Self::new(None)
    }
}
