//! Capability sandbox
//!
//! Every run gets a fresh interpreter context holding the ECMAScript
//! intrinsics plus an allow-list of host bindings:
//! - `console` - forwards to the run's `Capture`
//! - `setTimeout`/`setInterval` and their `clear*` pairs - host timer queue
//! - `fetch` - host network stack, only when `allow_network` is set
//!
//! Nothing else from the host is reachable. A context is never reused.

mod console;
mod fetch;
mod introspect;
mod jobs;
mod timers;

use crate::capture::Capture;
use crate::result::ThrownError;
use crate::{Result, SandboxConfig, SandpitError};
use boa_engine::error::JsNativeErrorKind;
use boa_engine::{Context, JsError, JsObject, JsResult, JsValue, Source, js_string};
use boa_gc::{Finalize, Trace};
use serde_json::Value as Json;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

pub(crate) use self::introspect::introspect;
use self::jobs::RunQueue;
use self::timers::TimerQueue;

/// Per-run host state shared by every binding
pub(crate) struct RunState {
    pub capture: Arc<Capture>,
    pub deadline: Instant,
    pub config: SandboxConfig,
    pub timers: RefCell<TimerQueue>,
}

impl RunState {
    /// True once the run may no longer produce observable effects
    pub fn cancelled(&self) -> bool {
        self.capture.is_sealed() || Instant::now() >= self.deadline
    }
}

/// Captures handed to native bindings
#[derive(Clone, Trace, Finalize)]
pub(crate) struct Host {
    #[unsafe_ignore_trace]
    pub run: Rc<RunState>,
    /// `Object.keys` as it was before user code ran
    pub object_keys: JsObject,
}

/// How an evaluation ended, as seen from inside the interpreter thread
#[derive(Debug)]
pub enum Evaluation {
    Completed(Json),
    Faulted(ThrownError),
    /// Loop iteration or recursion limit exhausted
    LimitExceeded,
}

/// A fresh, single-use interpreter context
pub struct Sandbox {
    context: Context,
    host: Host,
}

impl Sandbox {
    /// Build the context and install the allow-listed bindings
    ///
    /// Fails closed: if any binding or limit cannot be installed, no
    /// sandbox is returned and no user code runs.
    pub fn new(config: &SandboxConfig, capture: Arc<Capture>, deadline: Instant) -> Result<Self> {
        Self::build(config, capture, deadline)
            .map_err(|e| SandpitError::Sandbox(e.to_string()))
    }

    fn build(config: &SandboxConfig, capture: Arc<Capture>, deadline: Instant) -> JsResult<Self> {
        let run = Rc::new(RunState {
            capture,
            deadline,
            config: config.clone(),
            timers: RefCell::new(TimerQueue::default()),
        });
        let mut context = Context::builder()
            .job_queue(Rc::new(RunQueue::new(Rc::clone(&run))))
            .build()?;

        let limits = context.runtime_limits_mut();
        limits.set_loop_iteration_limit(config.loop_iteration_limit);
        limits.set_recursion_limit(config.recursion_limit);

        let object_keys = intrinsic(&mut context, "keys")?;
        let host = Host { run, object_keys };

        console::install(&mut context, &host)?;
        timers::install(&mut context, &host)?;
        if config.allow_network {
            fetch::install(&mut context, &host)?;
        }

        tracing::trace!(network = config.allow_network, "sandbox constructed");
        Ok(Self { context, host })
    }

    /// Evaluate a script, then drain promise jobs and due timers
    pub fn evaluate(&mut self, source: &str) -> Evaluation {
        let value = match self.context.eval(Source::from_bytes(source)) {
            Ok(value) => value,
            Err(err) => return self.fault(&err),
        };

        // the completion value is taken before timers get a chance to mutate it
        let return_value = if value.is_undefined() {
            Json::Null
        } else {
            introspect(&value, &self.host, &mut self.context).to_json()
        };

        match self.drain() {
            Some(err) => self.fault(&err),
            None => Evaluation::Completed(return_value),
        }
    }

    fn drain(&mut self) -> Option<JsError> {
        let run = Rc::clone(&self.host.run);
        let outcome = loop {
            self.context.run_jobs();
            if run.cancelled() {
                break None;
            }

            let next = run.timers.borrow_mut().pop_next();
            let Some(timer) = next else {
                break None;
            };
            if timer.due > run.deadline {
                tracing::debug!(
                    pending = run.timers.borrow().len() + 1,
                    "discarding timers due after the deadline"
                );
                break None;
            }

            let now = Instant::now();
            if timer.due > now {
                std::thread::sleep(timer.due - now);
            }
            if run.cancelled() {
                break None;
            }

            run.timers.borrow_mut().reschedule(&timer);
            if let Err(err) = timer.callback.call(&JsValue::undefined(), &timer.args, &mut self.context) {
                break Some(err);
            }
        };

        // queued callbacks hold interpreter references; release them with the context
        run.timers.borrow_mut().clear();
        outcome
    }

    fn fault(&mut self, err: &JsError) -> Evaluation {
        if let Some(native) = err.as_native() {
            if matches!(native.kind, JsNativeErrorKind::RuntimeLimit) {
                return Evaluation::LimitExceeded;
            }
        }
        Evaluation::Faulted(thrown_error(err, &self.host, &mut self.context))
    }
}

/// Read `name`, `message` and `stack` off a thrown value
fn thrown_error(err: &JsError, host: &Host, context: &mut Context) -> ThrownError {
    let thrown = err.to_opaque(context);

    let Some(object) = thrown.as_object().cloned() else {
        return ThrownError {
            kind: "Error".into(),
            message: introspect(&thrown, host, context).render(&host.run.config.render),
            stack: None,
        };
    };

    let read = |key: &str, context: &mut Context| -> Option<String> {
        let value = object.get(boa_engine::JsString::from(key), context).ok()?;
        if value.is_undefined() || value.is_null() {
            return None;
        }
        value
            .to_string(context)
            .ok()
            .map(|s| s.to_std_string_escaped())
    };

    let kind = read("name", context).unwrap_or_else(|| "Error".into());
    // plain objects carry no message; show what was thrown instead
    let message = read("message", context)
        .unwrap_or_else(|| introspect(&thrown, host, context).render(&host.run.config.render));
    ThrownError {
        kind,
        message,
        stack: read("stack", context),
    }
}

/// Look up `Object.<name>` before user code can replace it
fn intrinsic(context: &mut Context, name: &str) -> JsResult<JsObject> {
    let object = context.global_object().get(js_string!("Object"), context)?;
    let member = object
        .as_object()
        .map(|o| o.get(boa_engine::JsString::from(name), context))
        .transpose()?
        .unwrap_or_default();

    member.as_callable().cloned().ok_or_else(|| {
        boa_engine::JsNativeError::typ()
            .with_message(format!("intrinsic Object.{name} is not callable"))
            .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sandbox(config: &SandboxConfig) -> (Sandbox, Arc<Capture>) {
        let capture = Arc::new(Capture::new(config.max_entries, None));
        let deadline = Instant::now() + config.timeout;
        let sandbox = Sandbox::new(config, Arc::clone(&capture), deadline).unwrap();
        (sandbox, capture)
    }

    fn eval(source: &str) -> (Evaluation, Vec<crate::ConsoleEntry>) {
        let config = SandboxConfig::builder().allow_network(false).build();
        let (mut sandbox, capture) = sandbox(&config);
        let evaluation = sandbox.evaluate(source);
        (evaluation, capture.seal())
    }

    fn thrown(evaluation: Evaluation) -> ThrownError {
        match evaluation {
            Evaluation::Faulted(err) => err,
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn completion_value_is_returned() {
        let (evaluation, _) = eval("1 + 1");
        assert!(matches!(evaluation, Evaluation::Completed(v) if v == serde_json::json!(2)));
    }

    #[test]
    fn host_globals_are_absent() {
        for name in ["require", "process", "module", "Deno", "fetch"] {
            let (evaluation, _) = eval(&format!("{name}.toString()"));
            assert_eq!(thrown(evaluation).kind, "ReferenceError", "{name} should be absent");
        }
    }

    #[test]
    fn only_allow_listed_bindings_are_added() {
        let (evaluation, _) = eval(
            "['console','setTimeout','clearTimeout','setInterval','clearInterval']\
             .every(function (n) { return typeof globalThis[n] !== 'undefined'; })",
        );
        assert!(matches!(evaluation, Evaluation::Completed(v) if v == serde_json::json!(true)));
    }

    #[test]
    fn syntax_errors_keep_interpreter_kind() {
        let (evaluation, _) = eval("let = ;");
        assert_eq!(thrown(evaluation).kind, "SyntaxError");
    }

    #[test]
    fn thrown_primitives_are_reported_as_error() {
        let (evaluation, _) = eval("throw 'plain'");
        let err = thrown(evaluation);
        assert_eq!(err.kind, "Error");
        assert_eq!(err.message, "plain");
    }

    #[test]
    fn thrown_plain_objects_keep_their_content() {
        let (evaluation, _) = eval("throw {code: 1}");
        let err = thrown(evaluation);
        assert_eq!(err.kind, "Error");
        assert_eq!(err.message, "{\n  \"code\": 1\n}");

        let (evaluation, _) = eval("throw new Error()");
        assert_eq!(thrown(evaluation).message, "");
    }

    #[test]
    fn custom_error_names_survive() {
        let (evaluation, _) = eval(
            "class ValidationError extends Error { constructor(m) { super(m); this.name = 'ValidationError'; } }\
             throw new ValidationError('bad input')",
        );
        let err = thrown(evaluation);
        assert_eq!(err.kind, "ValidationError");
        assert_eq!(err.message, "bad input");
    }

    #[test]
    fn replacing_object_keys_does_not_affect_rendering() {
        let (_, entries) = eval("Object.keys = function () { return []; }; console.log({a: 1})");
        assert_eq!(entries[0].content, "{\n  \"a\": 1\n}");
    }

    #[test]
    fn loop_limit_is_reported_separately() {
        let config = SandboxConfig::builder()
            .allow_network(false)
            .loop_iteration_limit(1000)
            .build();
        let (mut sandbox, _) = sandbox(&config);
        assert!(matches!(sandbox.evaluate("while (true) {}"), Evaluation::LimitExceeded));
    }

    #[test]
    fn timers_due_after_deadline_are_discarded() {
        let config = SandboxConfig::builder()
            .allow_network(false)
            .timeout(Duration::from_millis(200))
            .max_timer_delay(Duration::from_secs(10))
            .build();
        let (mut sandbox, capture) = sandbox(&config);
        let evaluation = sandbox.evaluate(
            "setTimeout(function () { console.log('late'); }, 5000);\
             setTimeout(function () { console.log('early'); }, 10);",
        );
        assert!(matches!(evaluation, Evaluation::Completed(_)));
        let entries = capture.seal();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "early");
    }

    #[test]
    fn self_requeueing_promises_stop_at_the_deadline() {
        let config = SandboxConfig::builder()
            .allow_network(false)
            .timeout(Duration::from_millis(200))
            .build();
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let (mut sandbox, _) = sandbox(&config);
            let started = Instant::now();
            let evaluation = sandbox.evaluate("function f() { Promise.resolve().then(f); } f()");
            let _ = tx.send((matches!(evaluation, Evaluation::Completed(_)), started.elapsed()));
        });

        let (completed, elapsed) = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("interpreter thread still draining promise jobs");
        assert!(completed);
        assert!(elapsed >= Duration::from_millis(150), "stopped early: {elapsed:?}");
    }

    #[test]
    fn errors_in_timer_callbacks_fault_the_run() {
        let (evaluation, _) = eval("setTimeout(function () { null.x; }, 0); 5");
        assert_eq!(thrown(evaluation).kind, "TypeError");
    }

    #[test]
    fn promise_jobs_run_before_completion() {
        let (_, entries) = eval("Promise.resolve(3).then(function (v) { console.log(v * 2); })");
        assert_eq!(entries[0].content, "6");
    }
}
