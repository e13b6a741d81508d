//! Executor backed by a persistent per-backend daemon on a Unix socket.
//!
//! The daemon keeps its model in memory between calls. `load` connects to an
//! already running daemon or starts the configured command, `unload` asks it
//! to shut down.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Child, Command as ProcessCommand, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::protocol::{read_frame, write_frame, Command, RunnerRequest, RunnerResponse};
use crate::backend::{BackendExecutor, BackendKind, BackendOutput, Payload};
use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
/// Read bound for check and shutdown round trips.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct DaemonExecutor {
    backend: BackendKind,
    socket_path: PathBuf,
    command: Vec<String>,
    startup_timeout: Duration,
    call_timeout: Option<Duration>,
    load_timeout: Option<Duration>,
    child: Mutex<Option<Child>>,
}

impl DaemonExecutor {
    pub fn new(backend: BackendKind, socket_path: impl Into<PathBuf>, command: Vec<String>) -> Self {
        Self {
            backend,
            socket_path: socket_path.into(),
            command,
            startup_timeout: Duration::from_secs(10),
            call_timeout: None,
            load_timeout: None,
            child: Mutex::new(None),
        }
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Upper bound on waiting for an `execute` reply.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Upper bound on waiting for a `load` reply.
    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = Some(timeout);
        self
    }

    fn connect(&self, read_timeout: Option<Duration>) -> Result<UnixStream> {
        let stream = UnixStream::connect(&self.socket_path).map_err(|e| {
            Error::InferenceError(format!(
                "Failed to connect to {} daemon at {}: {}",
                self.backend,
                self.socket_path.display(),
                e
            ))
        })?;
        stream.set_read_timeout(read_timeout).ok();
        stream.set_write_timeout(Some(WRITE_TIMEOUT)).ok();
        Ok(stream)
    }

    fn call(&self, request: &RunnerRequest<'_>, read_timeout: Option<Duration>) -> Result<RunnerResponse> {
        let started = Instant::now();
        let mut stream = self.connect(read_timeout)?;
        write_frame(&mut stream, request)?;
        read_frame(&mut stream).map_err(|e| match e {
            Error::IoError(io)
                if matches!(
                    io.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                Error::Timeout {
                    backend: self.backend,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }
            }
            other => other,
        })
    }

    fn responds(&self) -> bool {
        self.socket_path.exists()
            && self
                .call(
                    &RunnerRequest::command(Command::Check, self.backend),
                    Some(CONTROL_TIMEOUT),
                )
                .and_then(RunnerResponse::check)
                .is_ok()
    }

    fn child(&self) -> MutexGuard<'_, Option<Child>> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.responds() {
            debug!("{} daemon already running", self.backend);
            return Ok(());
        }

        let (program, args) = self.command.split_first().ok_or_else(|| {
            Error::ModelLoadError(format!(
                "{} daemon not reachable at {} and no command configured",
                self.backend,
                self.socket_path.display()
            ))
        })?;

        info!("Starting {} daemon: {}", self.backend, self.command.join(" "));
        let child = ProcessCommand::new(program)
            .args(args)
            .env("RESIDENT_BACKEND", self.backend.as_str())
            .env("RESIDENT_SOCKET", &self.socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Error::ModelLoadError(format!("Failed to start {} daemon: {}", self.backend, e))
            })?;
        *self.child() = Some(child);

        let started = Instant::now();
        while started.elapsed() < self.startup_timeout {
            std::thread::sleep(POLL_INTERVAL);

            if let Some(child) = self.child().as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(Error::ModelLoadError(format!(
                        "{} daemon exited during startup ({})",
                        self.backend, status
                    )));
                }
            }
            if self.responds() {
                info!(
                    "{} daemon up after {:.1}s",
                    self.backend,
                    started.elapsed().as_secs_f64()
                );
                return Ok(());
            }
        }

        self.kill_child();
        Err(Error::ModelLoadError(format!(
            "{} daemon failed to start within {}s",
            self.backend,
            self.startup_timeout.as_secs()
        )))
    }

    fn kill_child(&self) {
        if let Some(mut child) = self.child().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl BackendExecutor for DaemonExecutor {
    fn load(&self) -> Result<()> {
        self.ensure_running()?;
        self.call(
            &RunnerRequest::command(Command::Load, self.backend),
            self.load_timeout,
        )?
            .check()
            .map_err(|e| Error::ModelLoadError(e.to_string()))?;
        Ok(())
    }

    fn execute(&self, payload: &Payload) -> Result<BackendOutput> {
        let request = RunnerRequest::execute(self.backend, payload.body());
        match self.call(&request, self.call_timeout) {
            Ok(response) => response.into_output(),
            // A dropped connection mid-call leaves the daemon in an unknown state.
            Err(Error::IoError(e)) => Err(Error::BackendFault(format!(
                "{} daemon connection lost: {}",
                self.backend, e
            ))),
            Err(e) => Err(e),
        }
    }

    fn unload(&self) -> Result<()> {
        if !self.socket_path.exists() {
            self.kill_child();
            return Ok(());
        }

        info!("Stopping {} daemon", self.backend);
        if let Err(e) = self.call(
            &RunnerRequest::command(Command::Shutdown, self.backend),
            Some(SHUTDOWN_GRACE),
        ) {
            debug!("{} daemon shutdown request: {}", self.backend, e);
        }

        let started = Instant::now();
        while started.elapsed() < SHUTDOWN_GRACE {
            if !self.socket_path.exists() {
                self.kill_child();
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        warn!("{} daemon ignored shutdown, killing it", self.backend);
        self.kill_child();
        Ok(())
    }
}

impl Drop for DaemonExecutor {
    fn drop(&mut self) {
        // Only daemons we started ourselves.
        self.kill_child();
    }
}
