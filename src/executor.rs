//! Running external programs (ryzenadj, systemctl, hook scripts).
//!
//! Everything that leaves the process goes through [`ProcessRunner`] so the
//! engine and the reconciler can be driven by [`FakeRunner`] in tests.

use crate::error::{Error, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// One external program call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Needs root; the runner wraps it in the configured escalation tool.
    pub privileged: bool,
}

impl Invocation {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            privileged: false,
        }
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }
}

impl std::fmt::Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// What came back from a finished (or abandoned) invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `None` when killed by a signal or by the timeout.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    pub fn timeout() -> Self {
        Self {
            timed_out: true,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }

    /// stdout and stderr joined, for pattern matching on diagnostics.
    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{}\n{}", out, err),
        }
    }
}

pub trait ProcessRunner: Send + Sync {
    /// Run to completion. `Err` means the program could not be started at all.
    fn run(&self, invocation: &Invocation) -> Result<ProcessOutput>;
}

impl<R: ProcessRunner + ?Sized> ProcessRunner for std::sync::Arc<R> {
    fn run(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        (**self).run(invocation)
    }
}

/// How privileged invocations gain root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Escalation {
    Pkexec,
    Sudo,
    /// Run as-is; only useful when already root.
    None,
}

impl Escalation {
    fn program(self) -> Option<&'static str> {
        match self {
            Escalation::Pkexec => Some("pkexec"),
            Escalation::Sudo => Some("sudo"),
            Escalation::None => None,
        }
    }
}

/// Runs real OS processes.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    escalation: Escalation,
    timeout: Duration,
    is_root: bool,
}

impl SystemRunner {
    pub fn new(escalation: Escalation, timeout: Duration) -> Self {
        Self {
            escalation,
            timeout,
            is_root: nix::unistd::geteuid().is_root(),
        }
    }

    /// Whether privileged invocations can succeed at all.
    pub fn can_escalate(&self) -> bool {
        self.is_root || self.escalation != Escalation::None
    }

    /// sudo asks for a password on the terminal.
    pub fn prompts_on_terminal(&self) -> bool {
        !self.is_root && self.escalation == Escalation::Sudo
    }

    /// pkexec authenticates each invocation separately.
    pub fn prompts_every_call(&self) -> bool {
        !self.is_root && self.escalation == Escalation::Pkexec
    }

    fn command_line(&self, invocation: &Invocation) -> (String, Vec<String>) {
        if invocation.privileged
            && !self.is_root
            && let Some(wrapper) = self.escalation.program()
        {
            let mut args = Vec::with_capacity(invocation.args.len() + 1);
            args.push(invocation.program.clone());
            args.extend(invocation.args.iter().cloned());
            return (wrapper.to_string(), args);
        }
        (invocation.program.clone(), invocation.args.clone())
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = source.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

impl ProcessRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        let (program, args) = self.command_line(invocation);
        debug!("exec: {} {}", program, args.join(" "));

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Executor {
                program: program.clone(),
                detail: if e.kind() == std::io::ErrorKind::NotFound {
                    format!("command not found (is {} installed?)", program)
                } else {
                    e.to_string()
                },
            })?;

        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    warn!(
                        "{} did not finish within {}s, killing it",
                        invocation,
                        self.timeout.as_secs()
                    );
                    let _ = child.kill();
                    let _ = child.wait();
                    // Grandchildren (e.g. behind pkexec) may still hold the
                    // pipes open, so the reader threads are left detached.
                    return Ok(ProcessOutput::timeout());
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    return Err(Error::Executor {
                        program,
                        detail: e.to_string(),
                    });
                }
            }
        };

        let join = |handle: Option<JoinHandle<String>>| {
            handle
                .and_then(|h| h.join().ok())
                .map(|s| s.trim().to_string())
                .unwrap_or_default()
        };

        Ok(ProcessOutput {
            code: status.code(),
            stdout: join(stdout),
            stderr: join(stderr),
            timed_out: false,
        })
    }
}

type Handler = Box<dyn Fn(&Invocation) -> Result<ProcessOutput> + Send + Sync>;

/// Records every invocation and answers with a scripted response.
pub struct FakeRunner {
    handler: Handler,
    calls: Mutex<Vec<Invocation>>,
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRunner {
    /// Every invocation succeeds with empty output.
    pub fn new() -> Self {
        Self::with_handler(|_| Ok(ProcessOutput::success("")))
    }

    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&Invocation) -> Result<ProcessOutput> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn clear(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl ProcessRunner for FakeRunner {
    fn run(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(invocation.clone());
        (self.handler)(invocation)
    }
}
