//! Blocking counterpart of [`super::process`] for callers without a runtime.
//!
//! The calling thread is parked until the child exits or the deadline
//! passes; helper threads feed stdin and drain stdout/stderr so that a chatty
//! child can never fill a pipe and stall.

use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::runtime::session::{build_args, killed_by_signal, Captured, Mode, Session, SessionState};
use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Run one invocation synchronously.
///
/// `stdin` is the already-encoded input buffer.
pub fn execute(config: &Config, command: &str, stdin: Option<Vec<u8>>, mode: Mode) -> Result<Captured> {
    let args = build_args(config, command, mode)?;
    let timeout = config.timeout();
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut session = Session::new(config.program.as_str());

    debug!(program = %config.program, ?args, cwd = %config.cwd.display(), "spawning (blocking)");

    let mut child = match Command::new(&config.program)
        .args(&args)
        .current_dir(&config.cwd)
        .env_clear()
        .envs(&config.env)
        .stdin(config.stdio.stdin.to_stdio())
        .stdout(config.stdio.stdout.to_stdio())
        .stderr(config.stdio.stderr.to_stdio())
        .spawn()
    {
        Ok(child) => child,
        Err(source) => {
            session.settle(SessionState::Failed);
            return Err(Error::spawn(config.program.as_str(), source));
        }
    };
    session.spawned();

    let writer = match (child.stdin.take(), stdin) {
        (Some(mut pipe), Some(bytes)) => Some(spawn_pipe(move || {
            if let Err(err) = pipe.write_all(&bytes) {
                debug!("stdin closed early: {}", err);
            }
        })),
        _ => None,
    };
    let stdout_reader = child.stdout.take().map(|stream| spawn_pipe(move || read_to_end(stream)));
    let stderr_reader = child.stderr.take().map(|stream| spawn_pipe(move || read_to_end(stream)));

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(err) => {
                session.settle(SessionState::Failed);
                return Err(Error::Io(err));
            }
        }
        if deadline.map_or(false, |d| Instant::now() >= d) {
            return Err(expire(&mut session, config, &mut child, timeout));
        }
        thread::sleep(POLL_INTERVAL);
    };

    // the deadline also covers draining: a background job of the child may
    // keep the pipes open long after the child itself exited
    if let Some(writer) = writer {
        if collect(&writer, deadline)?.is_none() {
            return Err(expire(&mut session, config, &mut child, timeout));
        }
    }
    let mut outputs = Vec::with_capacity(2);
    for reader in [stdout_reader, stderr_reader] {
        let bytes = match reader {
            Some(reader) => match collect(&reader, deadline)? {
                Some(bytes) => bytes?,
                None => return Err(expire(&mut session, config, &mut child, timeout)),
            },
            None => Vec::new(),
        };
        outputs.push(bytes);
    }
    let stderr = outputs.pop().unwrap_or_default();
    let stdout = outputs.pop().unwrap_or_default();

    if killed_by_signal(&status) {
        session.settle(SessionState::Failed);
        return Err(Error::Terminated {
            program: config.program.clone(),
            status,
        });
    }
    session.settle(SessionState::Succeeded);
    Ok(Captured {
        status,
        stdout,
        stderr,
    })
}

/// Settle as timed out, stop the child and build the error to return
fn expire(session: &mut Session, config: &Config, child: &mut Child, timeout: Option<Duration>) -> Error {
    session.settle(SessionState::TimedOut);
    let timeout_ms = timeout.map_or(0, |t| t.as_millis() as u64);
    info!(program = %config.program, timeout_ms, "timeout reached; terminating");
    match terminate(child, Duration::from_millis(config.kill_grace_ms)) {
        Ok(_) => Error::timeout(timeout_ms),
        Err(err) => Error::Io(err),
    }
}

/// Run `job` on a helper thread; its result arrives on the returned channel
fn spawn_pipe<T, F>(job: F) -> Receiver<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // the receiver is gone once the invocation gave up on this pipe
        let _ = tx.send(job());
    });
    rx
}

fn read_to_end<R: Read>(mut stream: R) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Wait for a helper thread's result; `None` when the deadline passed first
fn collect<T>(rx: &Receiver<T>, deadline: Option<Instant>) -> Result<Option<T>> {
    let received = match deadline {
        Some(deadline) => rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
    };
    match received {
        Ok(value) => Ok(Some(value)),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => Err(Error::Io(io::Error::new(
            io::ErrorKind::Other,
            "pipe thread panicked",
        ))),
    }
}

/// SIGTERM, wait up to `grace`, then kill and reap
fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    #[cfg(unix)]
    {
        // SAFETY: `child.id()` is our own child and has not been reaped yet
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }
        let give_up = Instant::now() + grace;
        while Instant::now() < give_up {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            thread::sleep(POLL_INTERVAL);
        }
        warn!(pid = child.id(), "child ignored SIGTERM; killing");
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(err) = child.kill() {
        debug!("kill failed: {}", err);
    }
    child.wait()
}
