//! Engine child process handle.
//!
//! Owns the scoring engine's process lifetime and its three pipe endpoints.
//! The handle is deliberately policy-free: schedulers decide what flows
//! through the pipes; this module guarantees that
//!
//! - the child is spawned with the requested stdio routing (stdout to
//!   `/dev/null` for write-only handles),
//! - stderr is continuously drained into a bounded tail ring so the engine
//!   can never block writing diagnostics,
//! - the child is reaped on every exit path: graceful `reap` waits a
//!   bounded grace period after stdin EOF, then force-kills; `Drop` kills
//!   outright if the child still runs.
//!
//! A handle becomes *poisoned* the first time the engine is observed gone
//! (unexpected exit, broken pipe, garbage on the score stream). Poisoning
//! is permanent; every later operation on the owning driver fails fast.

use std::io::Read;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::errors::DriverError;
use crate::stdx::TailRing;

/// Bytes of engine stderr retained for diagnostics.
const STDERR_RING_BYTES: usize = 64 * 1024;

/// Chunk size for the stderr drain thread.
const STDERR_READ_CHUNK: usize = 4096;

/// Poll interval while waiting for the child to exit.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// How to launch the scoring engine.
///
/// The engine's command line, model arguments, and output flags are the
/// caller's concern; the driver only requires that the process speaks the
/// line protocol on stdin/stdout.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Program to execute.
    pub program: String,
    /// Arguments passed verbatim.
    pub args: Vec<String>,
    /// Train-only handle: stdout routes to /dev/null and the read path is
    /// disabled. Mutually exclusive with `audit_mode`.
    pub write_only: bool,
    /// The engine emits per-feature audit lines instead of scores; only
    /// `explain_line` is available. Mutually exclusive with `write_only`.
    pub audit_mode: bool,
    /// Optional stdin pipe buffer resize (Linux `F_SETPIPE_SZ`).
    pub pipe_buffer_bytes: Option<usize>,
}

impl EngineConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            write_only: false,
            audit_mode: false,
            pipe_buffer_bytes: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn write_only(mut self, yes: bool) -> Self {
        self.write_only = yes;
        self
    }

    pub fn audit_mode(mut self, yes: bool) -> Self {
        self.audit_mode = yes;
        self
    }

    pub fn pipe_buffer_bytes(mut self, bytes: usize) -> Self {
        self.pipe_buffer_bytes = Some(bytes);
        self
    }
}

/// The pipe endpoints handed to a scheduler at construction.
///
/// `stdout` is `None` for write-only handles.
#[derive(Debug)]
pub(crate) struct EnginePipes {
    pub(crate) stdin: ChildStdin,
    pub(crate) stdout: Option<ChildStdout>,
}

/// Owns the engine child and its lifecycle.
#[derive(Debug)]
pub(crate) struct EngineHandle {
    child: Child,
    stderr_ring: Arc<Mutex<TailRing>>,
    stderr_thread: Option<thread::JoinHandle<()>>,
    exit_status: Option<ExitStatus>,
    audit_mode: bool,
    write_only: bool,
    poisoned: bool,
}

impl EngineHandle {
    /// Spawns the engine and returns the handle plus its pipes.
    ///
    /// With `nonblocking`, stdin and stdout are switched to `O_NONBLOCK`
    /// and the optional pipe-buffer resize is applied. Audit handles keep
    /// blocking pipes regardless: the explain exchange is strictly
    /// request/response.
    pub(crate) fn spawn(
        config: &EngineConfig,
        nonblocking: bool,
    ) -> Result<(Self, EnginePipes), DriverError> {
        if config.write_only && config.audit_mode {
            return Err(DriverError::bad_input(
                "write_only and audit_mode are mutually exclusive",
            ));
        }

        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stderr(Stdio::piped());
        if config.write_only {
            cmd.stdout(Stdio::null());
        } else {
            cmd.stdout(Stdio::piped());
        }

        let mut child = cmd.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DriverError::engine_gone("engine spawned without stdin pipe"))?;
        let stdout = if config.write_only {
            None
        } else {
            Some(child.stdout.take().ok_or_else(|| {
                DriverError::engine_gone("engine spawned without stdout pipe")
            })?)
        };

        let stderr_ring = Arc::new(Mutex::new(TailRing::with_capacity(STDERR_RING_BYTES)));
        let stderr_thread = child.stderr.take().map(|mut pipe| {
            let ring = Arc::clone(&stderr_ring);
            thread::spawn(move || {
                let mut buf = [0u8; STDERR_READ_CHUNK];
                loop {
                    match pipe.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if let Ok(mut ring) = ring.lock() {
                                ring.push(&buf[..n]);
                            }
                        }
                    }
                }
            })
        });

        #[cfg(unix)]
        if nonblocking && !config.audit_mode {
            use std::os::unix::io::AsRawFd;

            let setup = (|| {
                if let Some(bytes) = config.pipe_buffer_bytes {
                    crate::poll::set_pipe_buffer(stdin.as_raw_fd(), bytes)?;
                }
                crate::poll::set_nonblocking(stdin.as_raw_fd())?;
                if let Some(out) = &stdout {
                    crate::poll::set_nonblocking(out.as_raw_fd())?;
                }
                Ok::<(), std::io::Error>(())
            })();
            if let Err(err) = setup {
                // Don't leave a zombie behind a failed fd setup.
                let _ = child.kill();
                let _ = child.wait();
                return Err(err.into());
            }
        }
        #[cfg(not(unix))]
        let _ = nonblocking;

        let handle = Self {
            child,
            stderr_ring,
            stderr_thread,
            exit_status: None,
            audit_mode: config.audit_mode,
            write_only: config.write_only,
            poisoned: false,
        };
        Ok((handle, EnginePipes { stdin, stdout }))
    }

    pub(crate) fn audit_mode(&self) -> bool {
        self.audit_mode
    }

    pub(crate) fn write_only(&self) -> bool {
        self.write_only
    }

    /// Process liveness for precondition checks. A poisoned handle reports
    /// dead regardless of the child's actual state.
    pub(crate) fn is_alive(&mut self) -> bool {
        if self.poisoned || self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                false
            }
            Err(_) => false,
        }
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub(crate) fn poison(&mut self) {
        self.poisoned = true;
    }

    /// The retained tail of the engine's stderr, lossily decoded.
    pub(crate) fn stderr_tail(&self) -> String {
        self.stderr_ring
            .lock()
            .map(|ring| ring.to_lossy_string())
            .unwrap_or_default()
    }

    /// Poisons the handle and builds the terminal error, attaching the
    /// stderr tail when there is one.
    pub(crate) fn gone(&mut self, context: impl Into<String>) -> DriverError {
        self.poison();
        let mut detail = context.into();
        let tail = self.stderr_tail();
        if !tail.is_empty() {
            detail.push_str("; engine stderr: ");
            detail.push_str(tail.trim_end());
        }
        DriverError::engine_gone(detail)
    }

    /// Waits up to `grace` for the child to exit, then force-terminates.
    ///
    /// Callers close stdin first so a well-behaved engine exits on its own.
    /// Returns the exit status; the stderr drain thread is joined once the
    /// child is gone.
    pub(crate) fn reap(&mut self, grace: Duration) -> Result<ExitStatus, DriverError> {
        let status = match self.exit_status {
            Some(status) => status,
            None => {
                let deadline = Instant::now() + grace;
                loop {
                    match self.child.try_wait()? {
                        Some(status) => break status,
                        None if Instant::now() >= deadline => {
                            let _ = self.child.kill();
                            break self.child.wait()?;
                        }
                        None => thread::sleep(REAP_POLL_INTERVAL),
                    }
                }
            }
        };
        self.exit_status = Some(status);

        if let Some(thread) = self.stderr_thread.take() {
            let _ = thread.join();
        }
        Ok(status)
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if self.exit_status.is_none() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
        if let Some(thread) = self.stderr_thread.take() {
            let _ = thread.join();
        }
    }
}
