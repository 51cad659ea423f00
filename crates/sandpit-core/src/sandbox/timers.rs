//! Timer bindings backed by a host-side queue
//!
//! Callbacks never run on their own; the sandbox drains the queue after the
//! script body finishes, in due order, and stops at the run's deadline.

use super::Host;
use boa_engine::{
    Context, JsArgs, JsNativeError, JsObject, JsResult, JsString, JsValue, NativeFunction,
};
use std::time::{Duration, Instant};

/// Intervals never fire more often than this
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub(crate) struct Timer {
    pub id: u32,
    pub due: Instant,
    seq: u64,
    pub callback: JsObject,
    pub args: Vec<JsValue>,
    pub interval: Option<Duration>,
}

#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    timers: Vec<Timer>,
    next_id: u32,
    next_seq: u64,
}

impl TimerQueue {
    pub fn schedule(
        &mut self,
        callback: JsObject,
        args: Vec<JsValue>,
        delay: Duration,
        repeat: bool,
    ) -> u32 {
        self.next_id += 1;
        let id = self.next_id;
        let seq = self.bump_seq();
        self.timers.push(Timer {
            id,
            due: Instant::now() + delay,
            seq,
            callback,
            args,
            interval: repeat.then(|| delay.max(MIN_INTERVAL)),
        });
        id
    }

    pub fn cancel(&mut self, id: u32) {
        self.timers.retain(|t| t.id != id);
    }

    /// Remove and return the earliest due timer, oldest first on ties
    pub fn pop_next(&mut self) -> Option<Timer> {
        let idx = self
            .timers
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| (t.due, t.seq))
            .map(|(i, _)| i)?;
        Some(self.timers.swap_remove(idx))
    }

    /// Queue the next firing of an interval timer under the same id
    pub fn reschedule(&mut self, fired: &Timer) {
        if let Some(interval) = fired.interval {
            let seq = self.bump_seq();
            self.timers.push(Timer {
                due: fired.due + interval,
                seq,
                ..fired.clone()
            });
        }
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

pub(super) fn install(context: &mut Context, host: &Host) -> JsResult<()> {
    let bindings: [(&str, NativeFunction); 4] = [
        (
            "setTimeout",
            NativeFunction::from_copy_closure_with_captures(
                |_, args, host, ctx| schedule(args, false, host, ctx),
                host.clone(),
            ),
        ),
        (
            "setInterval",
            NativeFunction::from_copy_closure_with_captures(
                |_, args, host, ctx| schedule(args, true, host, ctx),
                host.clone(),
            ),
        ),
        (
            "clearTimeout",
            NativeFunction::from_copy_closure_with_captures(cancel, host.clone()),
        ),
        (
            "clearInterval",
            NativeFunction::from_copy_closure_with_captures(cancel, host.clone()),
        ),
    ];

    for (name, function) in bindings {
        context.register_global_callable(JsString::from(name), 2, function)?;
    }
    Ok(())
}

fn schedule(args: &[JsValue], repeat: bool, host: &Host, context: &mut Context) -> JsResult<JsValue> {
    let Some(callback) = args.get_or_undefined(0).as_callable().cloned() else {
        return Err(JsNativeError::typ()
            .with_message("timer callback must be a function")
            .into());
    };

    let delay = clamp_delay(
        args.get_or_undefined(1).to_number(context)?,
        host.run.config.max_timer_delay,
    );
    let extra = args.get(2..).unwrap_or_default().to_vec();

    let id = host
        .run
        .timers
        .borrow_mut()
        .schedule(callback, extra, delay, repeat);
    Ok(JsValue::from(f64::from(id)))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn cancel(_: &JsValue, args: &[JsValue], host: &Host, context: &mut Context) -> JsResult<JsValue> {
    let id = args.get_or_undefined(0).to_number(context)?;
    if id.is_finite() && id >= 1.0 && id <= f64::from(u32::MAX) {
        host.run.timers.borrow_mut().cancel(id as u32);
    }
    Ok(JsValue::undefined())
}

/// Negative and NaN delays fire immediately; large ones are clamped, not rejected
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_delay(ms: f64, max: Duration) -> Duration {
    if !ms.is_finite() {
        return if ms == f64::INFINITY { max } else { Duration::ZERO };
    }
    if ms <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_millis(ms as u64).min(max)
}
