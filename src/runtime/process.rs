use crate::core::config::{Config, StreamMode};
use crate::core::error::{Error, Result};
use crate::core::tokenize;
use crate::runtime::session::{build_args, killed_by_signal, Captured, Mode, Session, SessionState};
use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum Trigger {
    Closed(Result<Captured>),
    TimedOut,
    Cancelled,
}

/// Run one invocation of `config.program` to completion.
///
/// `stdin` is written to the child right after spawn and then closed. The
/// invocation is done once the child exited and its stdout and stderr are
/// closed; until then it races the configured timeout and `cancel`. Whichever
/// comes first decides the outcome, and a timed-out or cancelled child is
/// waited for before this returns.
pub async fn execute(
    config: &Config,
    command: &str,
    stdin: Option<Vec<u8>>,
    mode: Mode,
    cancel: CancellationToken,
) -> Result<Captured> {
    let args = build_args(config, command, mode)?;
    let timeout = config.timeout();
    let mut session = Session::new(config.program.as_str());

    debug!(program = %config.program, ?args, cwd = %config.cwd.display(), "spawning");

    // armed before spawn so the child's startup time counts against it
    let sleep = timeout.map(tokio::time::sleep);
    let timer = async move {
        match sleep {
            Some(sleep) => sleep.await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(timer);

    let mut child = match command_for(config, &args).spawn() {
        Ok(child) => child,
        Err(source) => {
            session.settle(SessionState::Failed);
            return Err(Error::spawn(config.program.as_str(), source));
        }
    };
    session.spawned();

    let writer = match (child.stdin.take(), stdin) {
        (Some(pipe), Some(bytes)) => Some(tokio::spawn(write_stdin(pipe, bytes))),
        // no payload: closing stdin right away gives the child EOF
        _ => None,
    };
    let stdout_task = tokio::spawn(read_all(child.stdout.take()));
    let stderr_task = tokio::spawn(read_all(child.stderr.take()));

    // the invocation is over once the child exited and its pipes are closed;
    // the timer and the token stay armed until then
    let trigger = tokio::select! {
        biased;
        _ = cancel.cancelled() => Trigger::Cancelled,
        captured = close(&mut child, writer, stdout_task, stderr_task) => Trigger::Closed(captured),
        _ = &mut timer => Trigger::TimedOut,
    };

    match trigger {
        Trigger::Closed(Ok(captured)) => {
            if killed_by_signal(&captured.status) {
                session.settle(SessionState::Failed);
                return Err(Error::Terminated {
                    program: config.program.clone(),
                    status: captured.status,
                });
            }
            session.settle(SessionState::Succeeded);
            debug!(
                program = %config.program,
                status = %captured.status,
                stdout = captured.stdout.len(),
                stderr = captured.stderr.len(),
                "process closed"
            );
            Ok(captured)
        }
        Trigger::Closed(Err(err)) => {
            session.settle(SessionState::Failed);
            Err(err)
        }
        Trigger::TimedOut => {
            session.settle(SessionState::TimedOut);
            let timeout_ms = timeout.map_or(0, |t| t.as_millis() as u64);
            info!(program = %config.program, timeout_ms, "timeout reached; terminating");
            terminate(&mut child, Duration::from_millis(config.kill_grace_ms)).await?;
            Err(Error::timeout(timeout_ms))
        }
        Trigger::Cancelled => {
            session.settle(SessionState::Cancelled);
            info!(program = %config.program, "cancelled; terminating");
            terminate(&mut child, Duration::from_millis(config.kill_grace_ms)).await?;
            Err(Error::Cancelled)
        }
    }
}

/// Exit status plus everything written to stdout and stderr, available once
/// the child exited and every holder of its pipes let go of them
async fn close(
    child: &mut Child,
    writer: Option<JoinHandle<()>>,
    stdout_task: JoinHandle<io::Result<Vec<u8>>>,
    stderr_task: JoinHandle<io::Result<Vec<u8>>>,
) -> Result<Captured> {
    let status = child.wait().await?;
    if let Some(writer) = writer {
        writer.await?;
    }
    let (stdout, stderr) = futures::future::try_join(stdout_task, stderr_task).await?;
    Ok(Captured {
        status,
        stdout: stdout?,
        stderr: stderr?,
    })
}

/// Launch the visual client with connection flags and wait for it to close.
///
/// No codec, no timeout: the only outcome is the exit status.
pub async fn launch_visual(config: &Config, command: &str) -> Result<ExitStatus> {
    let mut args = config.visual_flags();
    args.extend(tokenize(command)?);
    debug!(program = %config.visual_program, ?args, "launching visual client");

    let mut child = Command::new(&config.visual_program)
        .args(&args)
        .current_dir(&config.cwd)
        .env_clear()
        .envs(&config.env)
        .spawn()
        .map_err(|source| Error::spawn(config.visual_program.as_str(), source))?;
    Ok(child.wait().await?)
}

fn command_for(config: &Config, args: &[String]) -> Command {
    let mut command = Command::new(&config.program);
    command
        .args(args)
        .current_dir(&config.cwd)
        .env_clear()
        .envs(&config.env)
        .stdin(config.stdio.stdin.to_stdio())
        .stdout(config.stdio.stdout.to_stdio())
        .stderr(config.stdio.stderr.to_stdio())
        .kill_on_drop(true);
    if config.stdio.stdout != StreamMode::Pipe {
        debug!("stdout is not piped; the reply will be empty");
    }
    command
}

async fn write_stdin(mut pipe: tokio::process::ChildStdin, bytes: Vec<u8>) {
    // a child that exits without reading its input is not an error
    if let Err(err) = pipe.write_all(&bytes).await {
        debug!("stdin closed early: {}", err);
        return;
    }
    if let Err(err) = pipe.shutdown().await {
        debug!("failed to close stdin: {}", err);
    }
}

async fn read_all<R: AsyncRead + Unpin>(stream: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Ask the child to stop, force it after `grace`, and reap it
async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is our own child and has not been reaped yet
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => return status,
            Err(_) => warn!(pid, "child ignored SIGTERM; killing"),
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(err) = child.kill().await {
        debug!("kill failed: {}", err);
    }
    child.wait().await
}
