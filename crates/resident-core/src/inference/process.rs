//! Executor that starts one runner process per call.
//!
//! Nothing stays resident between calls, so `load` only checks that the
//! runner works. A runner still going at its deadline is killed, and so is
//! one caught running by `unload`.

use std::io::{Read, Write};
use std::process::{Child, Command as ProcessCommand, ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::protocol::{parse_stdout, write_json, Command, RunnerRequest, RunnerResponse};
use crate::backend::{BackendExecutor, BackendKind, BackendOutput, Payload};
use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct ProcessExecutor {
    backend: BackendKind,
    command: Vec<String>,
    call_timeout: Option<Duration>,
    load_timeout: Option<Duration>,
    running: Mutex<Option<Child>>,
}

impl ProcessExecutor {
    pub fn new(backend: BackendKind, command: Vec<String>) -> Self {
        Self {
            backend,
            command,
            call_timeout: None,
            load_timeout: None,
            running: Mutex::new(None),
        }
    }

    /// Deadline for an `execute` run.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Deadline for the `load` check run.
    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = Some(timeout);
        self
    }

    fn running(&self) -> MutexGuard<'_, Option<Child>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn call(&self, request: &RunnerRequest<'_>, timeout: Option<Duration>) -> Result<RunnerResponse> {
        let (program, args) = self.command.split_first().ok_or_else(|| {
            Error::ConfigError(format!("No runner command for {}", self.backend))
        })?;
        let body = write_json(request)?;

        let started = Instant::now();
        let mut child = ProcessCommand::new(program)
            .args(args)
            .env("RESIDENT_BACKEND", self.backend.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::InferenceError(format!("Failed to start {} runner: {}", self.backend, e)))?;

        // Pipes are serviced off this thread so a runner that stops reading or
        // fills its output buffer cannot stall the deadline check.
        let stdin = child.stdin.take();
        let backend = self.backend;
        let writer = thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(&body) {
                    debug!("{} runner closed stdin early: {}", backend, e);
                }
            }
        });
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        *self.running() = Some(child);

        let status = self.wait(timeout, started)?;
        let _ = writer.join();
        let stdout = collect(stdout);
        let stderr = collect(stderr);

        if !status.success() {
            return Err(Error::InferenceError(format!(
                "{} runner exited with {}: {}",
                self.backend,
                status,
                String::from_utf8_lossy(&stderr).trim()
            )));
        }

        parse_stdout(&String::from_utf8_lossy(&stdout))
    }

    /// Poll the running child until it exits or the deadline passes.
    fn wait(&self, timeout: Option<Duration>, started: Instant) -> Result<ExitStatus> {
        loop {
            {
                let mut running = self.running();
                let Some(child) = running.as_mut() else {
                    return Err(Error::Cancelled(format!(
                        "{} runner stopped by unload",
                        self.backend
                    )));
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        running.take();
                        return Ok(status);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        running.take();
                        return Err(Error::InferenceError(format!(
                            "{} runner failed: {}",
                            self.backend, e
                        )));
                    }
                }

                if timeout.is_some_and(|limit| started.elapsed() >= limit) {
                    if let Some(mut child) = running.take() {
                        warn!("Killing {} runner after {:?}", self.backend, started.elapsed());
                        let _ = child.kill();
                        let _ = child.wait();
                    }
                    return Err(Error::Timeout {
                        backend: self.backend,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn kill_running(&self) {
        if let Some(mut child) = self.running().take() {
            warn!("Killing running {} runner", self.backend);
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

impl BackendExecutor for ProcessExecutor {
    fn load(&self) -> Result<()> {
        let response = self
            .call(
                &RunnerRequest::command(Command::Check, self.backend),
                self.load_timeout,
            )
            .and_then(RunnerResponse::check)
            .map_err(|e| Error::ModelLoadError(e.to_string()))?;

        if response.status.as_deref() != Some("ok") {
            warn!(
                "{} runner check returned status {:?}",
                self.backend, response.status
            );
        }
        debug!("{} runner available", self.backend);
        Ok(())
    }

    fn execute(&self, payload: &Payload) -> Result<BackendOutput> {
        self.call(
            &RunnerRequest::execute(self.backend, payload.body()),
            self.call_timeout,
        )?
            .into_output()
    }

    fn unload(&self) -> Result<()> {
        self.kill_running();
        Ok(())
    }
}

impl Drop for ProcessExecutor {
    fn drop(&mut self) {
        self.kill_running();
    }
}
