//! Promise job queue bound to a run's deadline

use super::RunState;
use boa_engine::Context;
use boa_engine::job::{FutureJob, JobQueue, NativeJob};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::task::{Poll, Waker};

/// FIFO promise queue that stops once the run is cancelled
///
/// A callback that keeps requeueing itself never trips the loop iteration
/// limit, so cancellation is checked between jobs.
pub(crate) struct RunQueue {
    run: Rc<RunState>,
    jobs: RefCell<VecDeque<NativeJob>>,
}

impl RunQueue {
    pub fn new(run: Rc<RunState>) -> Self {
        Self {
            run,
            jobs: RefCell::default(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.jobs.borrow().len()
    }
}

impl JobQueue for RunQueue {
    fn enqueue_promise_job(&self, job: NativeJob, _: &mut Context) {
        self.jobs.borrow_mut().push_back(job);
    }

    fn run_jobs(&self, context: &mut Context) {
        loop {
            if self.run.cancelled() {
                let dropped = std::mem::take(&mut *self.jobs.borrow_mut()).len();
                if dropped > 0 {
                    tracing::debug!(dropped, "run cancelled, discarding promise jobs");
                }
                return;
            }
            let Some(job) = self.jobs.borrow_mut().pop_front() else {
                return;
            };
            if job.call(context).is_err() {
                self.jobs.borrow_mut().clear();
                return;
            }
        }
    }

    fn enqueue_future_job(&self, mut future: FutureJob, context: &mut Context) {
        // no binding produces host futures; anything ready is run, the rest dropped
        let mut cx = std::task::Context::from_waker(Waker::noop());
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(job) => self.enqueue_promise_job(job, context),
            Poll::Pending => tracing::warn!("pending host future dropped"),
        }
    }
}
