//! Worker processes
//!
//! A worker is the service binary started with `--worker`. It applies the
//! filesystem policy, announces itself with a `Ready` frame and then serves
//! one run at a time from stdin, streaming `Entry` frames and a final
//! `Done`. The supervisor side ([`Worker`]) owns the child, enforces the
//! deadline from outside and kills the process when the run overstays it,
//! which is the only way to take the CPU back from a runaway script.

use crate::capture::{ConsoleEntry, EntryListener};
use crate::engine::{Engine, RunJob, Runner};
use crate::pipe::{FrameReader, FrameWriter};
use crate::protocol::{self, WorkerFrame, WorkerRequest};
use crate::result::{ExecutionResult, Outcome, ThrownError};
use crate::{Result, SandboxConfig, SandpitError};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

/// Environment variable carrying the worker's `SandboxConfig` as JSON
pub const CONFIG_ENV: &str = "SANDPIT_WORKER_CONFIG";

/// How long a fresh worker gets to send `Ready`
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Ready to accept work
    Idle,
    /// Currently executing a run
    Busy,
    /// Being killed and respawned
    Recycling,
    /// Not running
    Dead,
}

/// How to start a worker process
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// The running binary in worker mode
    pub fn current_exe() -> Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec!["--worker".into()],
        })
    }
}

/// Supervisor-side handle to one worker process
pub struct Worker {
    pub id: u32,
    pub state: WorkerState,
    pub execution_count: u64,
    command: WorkerCommand,
    config: SandboxConfig,
    kill_grace: Duration,
    child: Option<Child>,
    requests: Option<FrameWriter<ChildStdin>>,
    frames: Option<Receiver<Result<WorkerFrame>>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("pid", &self.pid())
            .field("execution_count", &self.execution_count)
            .finish_non_exhaustive()
    }
}

impl Worker {
    #[must_use]
    pub const fn new(
        id: u32,
        command: WorkerCommand,
        config: SandboxConfig,
        kill_grace: Duration,
    ) -> Self {
        Self {
            id,
            state: WorkerState::Dead,
            execution_count: 0,
            command,
            config,
            kill_grace,
            child: None,
            requests: None,
            frames: None,
        }
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Start the process and wait for its `Ready` frame
    pub fn spawn(&mut self) -> Result<()> {
        tracing::info!(worker_id = self.id, "spawning worker");

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .env(CONFIG_ENV, serde_json::to_string(&self.config)?)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                terminate(&mut child);
                return Err(SandpitError::Worker("worker pipes unavailable".into()));
            }
        };

        let frames = spawn_reader(self.id, stdout)?;
        match frames.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Ok(WorkerFrame::Ready)) => {}
            Ok(Ok(other)) => {
                terminate(&mut child);
                return Err(SandpitError::Protocol(format!(
                    "expected ready frame, got {other:?}"
                )));
            }
            Ok(Err(e)) => {
                terminate(&mut child);
                return Err(e);
            }
            Err(_) => {
                terminate(&mut child);
                return Err(SandpitError::Worker(format!(
                    "worker {} did not become ready",
                    self.id
                )));
            }
        }

        tracing::info!(worker_id = self.id, pid = child.id(), "worker spawned and ready");

        self.child = Some(child);
        self.requests = Some(FrameWriter::new(stdin));
        self.frames = Some(frames);
        self.state = WorkerState::Idle;
        Ok(())
    }

    /// Run one job; kills the worker if it overstays `timeout + kill_grace`
    pub fn execute(&mut self, job: &RunJob) -> Result<ExecutionResult> {
        if self.state != WorkerState::Idle {
            return Err(SandpitError::Worker(format!(
                "worker {} is not idle (state: {:?})",
                self.id, self.state
            )));
        }

        self.state = WorkerState::Busy;
        tracing::debug!(worker_id = self.id, source_len = job.source.len(), "sending run to worker");

        let started = Instant::now();
        let request = WorkerRequest::Execute {
            source: job.source.clone(),
            timeout_ms: u64::try_from(job.timeout.as_millis()).unwrap_or(u64::MAX),
        };
        if let Err(e) = self.send_request(&request) {
            self.kill();
            return Err(e);
        }

        let hard_deadline = started + job.timeout + self.kill_grace;
        let mut received: Vec<ConsoleEntry> = Vec::new();

        loop {
            let wait = hard_deadline.saturating_duration_since(Instant::now());
            let next = match self.frames.as_ref() {
                Some(frames) => frames.recv_timeout(wait),
                None => Err(RecvTimeoutError::Disconnected),
            };

            match next {
                Ok(Ok(WorkerFrame::Entry(entry))) => {
                    if let Some(listener) = &job.listener {
                        listener(&entry);
                    }
                    received.push(entry);
                }
                Ok(Ok(WorkerFrame::Done(result))) => {
                    self.execution_count += 1;
                    self.state = WorkerState::Idle;
                    tracing::debug!(
                        worker_id = self.id,
                        execution_count = self.execution_count,
                        outcome = ?result.outcome,
                        "run completed"
                    );
                    return Ok(result);
                }
                Ok(Ok(WorkerFrame::Failed(message))) => {
                    self.execution_count += 1;
                    self.state = WorkerState::Idle;
                    return Err(SandpitError::Sandbox(message));
                }
                Ok(Ok(WorkerFrame::Ready)) => {}
                Ok(Err(e)) => {
                    self.kill();
                    return Err(e);
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(
                        worker_id = self.id,
                        timeout_ms = u64::try_from(job.timeout.as_millis()).unwrap_or(u64::MAX),
                        "worker overstayed deadline, killing it"
                    );
                    self.kill();
                    return Ok(ExecutionResult::assemble(
                        Outcome::TimedOut,
                        None,
                        Some(ThrownError::timeout(job.timeout)),
                        received,
                        started.elapsed(),
                    ));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.kill();
                    return Err(SandpitError::Worker(format!(
                        "worker {} exited mid-run",
                        self.id
                    )));
                }
            }
        }
    }

    fn send_request(&mut self, request: &WorkerRequest) -> Result<()> {
        let requests = self
            .requests
            .as_mut()
            .ok_or_else(|| SandpitError::Worker("worker pipes not initialized".into()))?;
        requests.send(&protocol::encode(request)?)
    }

    /// Kill the process and start a fresh one
    pub fn recycle(&mut self) -> Result<()> {
        tracing::info!(worker_id = self.id, "recycling worker");
        self.state = WorkerState::Recycling;
        self.kill();
        self.execution_count = 0;
        self.spawn()
    }

    #[must_use]
    pub const fn should_recycle(&self, max_executions: u64) -> bool {
        self.execution_count >= max_executions
    }

    /// Ask the worker to exit on its own
    pub fn shutdown(&mut self) {
        if let Err(e) = self.send_request(&WorkerRequest::Shutdown) {
            tracing::debug!(worker_id = self.id, error = %e, "shutdown request not delivered");
        }
        self.kill();
    }

    fn kill(&mut self) {
        self.requests = None;
        self.frames = None;
        if let Some(mut child) = self.child.take() {
            terminate(&mut child);
        }
        self.state = WorkerState::Dead;
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.kill();
    }
}

fn terminate(child: &mut Child) {
    if let Ok(pid) = i32::try_from(child.id()) {
        // already exited is fine
        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
    }
    if let Err(e) = child.wait() {
        tracing::warn!(pid = child.id(), error = %e, "failed to reap worker");
    }
}

/// Decode frames from the worker's stdout on a dedicated thread
fn spawn_reader<R: Read + Send + 'static>(
    worker_id: u32,
    stdout: R,
) -> Result<Receiver<Result<WorkerFrame>>> {
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name(format!("sandpit-worker-{worker_id}"))
        .spawn(move || {
            let mut reader = FrameReader::new(stdout);
            loop {
                let frame = match reader.recv() {
                    Ok(Some(body)) => protocol::decode(&body).map_err(SandpitError::from),
                    Ok(None) => break,
                    Err(e) => Err(e),
                };
                let failed = frame.is_err();
                if tx.send(frame).is_err() || failed {
                    break;
                }
            }
        })?;
    Ok(rx)
}

/// Read the config handed over by the supervisor, or the defaults
pub fn config_from_env() -> Result<SandboxConfig> {
    match std::env::var(CONFIG_ENV) {
        Ok(raw) => serde_json::from_str(&raw)
            .map_err(|e| SandpitError::Config(format!("{CONFIG_ENV}: {e}"))),
        Err(_) => Ok(SandboxConfig::default()),
    }
}

/// Entry point of a worker process
///
/// Stdout carries frames only; logging must go to stderr.
pub fn worker_main(config: SandboxConfig) -> Result<()> {
    crate::isolation::restrict_worker();
    tracing::info!(pid = std::process::id(), "worker entering main loop");
    serve(std::io::stdin().lock(), std::io::stdout(), &Engine::new(config))
}

type SharedWriter<W> = Arc<Mutex<FrameWriter<W>>>;

/// Serve runs until `Shutdown` or end of input
pub fn serve<R, W>(input: R, output: W, engine: &Engine) -> Result<()>
where
    R: Read,
    W: Write + Send + 'static,
{
    let mut requests = FrameReader::new(input);
    let out: SharedWriter<W> = Arc::new(Mutex::new(FrameWriter::new(output)));
    send(&out, &WorkerFrame::Ready)?;

    while let Some(body) = requests.recv()? {
        let (source, timeout_ms) = match protocol::decode::<WorkerRequest>(&body)? {
            WorkerRequest::Execute { source, timeout_ms } => (source, timeout_ms),
            WorkerRequest::Shutdown => break,
        };

        let sink = Arc::clone(&out);
        let listener: EntryListener = Arc::new(move |entry: &ConsoleEntry| {
            if let Err(e) = send(&sink, &WorkerFrame::Entry(entry.clone())) {
                tracing::warn!(error = %e, "failed to stream entry");
            }
        });

        let job = RunJob::new(source, Duration::from_millis(timeout_ms)).with_listener(listener);
        let frame = match engine.run(job) {
            Ok(result) => WorkerFrame::Done(result),
            Err(e) => {
                tracing::error!(error = %e, "run failed to start");
                WorkerFrame::Failed(e.to_string())
            }
        };
        send(&out, &frame)?;
    }

    tracing::info!("worker input closed, exiting");
    Ok(())
}

fn send<W: Write>(out: &SharedWriter<W>, frame: &WorkerFrame) -> Result<()> {
    let body = protocol::encode(frame)?;
    out.lock().send(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn requests(reqs: &[WorkerRequest]) -> Cursor<Vec<u8>> {
        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        for req in reqs {
            writer.send(&protocol::encode(req).unwrap()).unwrap();
        }
        Cursor::new(buf)
    }

    fn frames(buf: &SharedBuf) -> Vec<WorkerFrame> {
        let bytes = buf.0.lock().clone();
        let mut reader = FrameReader::new(Cursor::new(bytes));
        let mut out = Vec::new();
        while let Some(body) = reader.recv().unwrap() {
            out.push(protocol::decode(&body).unwrap());
        }
        out
    }

    fn engine() -> Engine {
        Engine::new(SandboxConfig::builder().allow_network(false).build())
    }

    #[test]
    fn serve_streams_entries_before_done() {
        let out = SharedBuf::default();
        let input = requests(&[WorkerRequest::Execute {
            source: "console.log('a'); console.error('b'); 7".into(),
            timeout_ms: 2_000,
        }]);
        serve(input, out.clone(), &engine()).unwrap();

        let frames = frames(&out);
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0], WorkerFrame::Ready);
        assert!(matches!(&frames[1], WorkerFrame::Entry(e) if e.content == "a"));
        assert!(matches!(&frames[2], WorkerFrame::Entry(e) if e.content == "b" && e.emitted_at == 1));
        let WorkerFrame::Done(result) = &frames[3] else {
            panic!("expected done, got {:?}", frames[3]);
        };
        assert_eq!(result.return_value, serde_json::json!(7));
        assert_eq!(result.error_entries, vec!["b"]);
    }

    #[test]
    fn serve_stops_at_shutdown() {
        let out = SharedBuf::default();
        let input = requests(&[
            WorkerRequest::Shutdown,
            WorkerRequest::Execute {
                source: "1".into(),
                timeout_ms: 2_000,
            },
        ]);
        serve(input, out.clone(), &engine()).unwrap();
        assert_eq!(frames(&out), vec![WorkerFrame::Ready]);
    }

    #[test]
    fn unresponsive_worker_fails_to_spawn() {
        let command = WorkerCommand {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), "exit 0".into()],
        };
        let mut worker = Worker::new(0, command, SandboxConfig::default(), Duration::from_millis(100));
        assert!(worker.spawn().is_err());
        assert_eq!(worker.state, WorkerState::Dead);
        assert!(worker.pid().is_none());
    }

    #[test]
    fn executing_a_dead_worker_is_an_error() {
        let command = WorkerCommand {
            program: "/bin/true".into(),
            args: Vec::new(),
        };
        let mut worker = Worker::new(1, command, SandboxConfig::default(), Duration::ZERO);
        let job = RunJob::new("1", Duration::from_secs(1));
        assert!(matches!(worker.execute(&job), Err(SandpitError::Worker(_))));
        assert!(!worker.should_recycle(1));
    }

    #[test]
    fn config_round_trips_through_the_environment_format() {
        let config = SandboxConfig::builder().timeout_ms(1234).allow_network(false).build();
        let raw = serde_json::to_string(&config).unwrap();
        let parsed: SandboxConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.timeout, Duration::from_millis(1234));
        assert!(!parsed.allow_network);
    }
}
