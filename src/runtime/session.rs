//! Lifecycle bookkeeping shared by the async and blocking process paths.

use crate::core::config::Config;
use crate::core::error::Result;
use crate::core::tokenize;
use std::process::ExitStatus;
use tracing::debug;

/// Flag asking `p4` for marshalled input and output
pub const MARSHAL_FLAG: &str = "-G";

/// Whether an invocation goes through the wire codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// `-G`: marshalled stdin/stdout, decoded and aggregated
    Marshal,
    /// Plain text in and out
    Raw,
}

/// Full argument list: wrapper arguments, mode flag, connection flags, then
/// the command tokens
pub fn build_args(config: &Config, command: &str, mode: Mode) -> Result<Vec<String>> {
    let tokens = tokenize(command)?;
    let flags = config.global_flags();
    let mut args = Vec::with_capacity(config.program_args.len() + 1 + flags.len() + tokens.len());
    args.extend(config.program_args.iter().cloned());
    if mode == Mode::Marshal {
        args.push(MARSHAL_FLAG.to_string());
    }
    args.extend(flags);
    args.extend(tokens);
    Ok(args)
}

/// Where one invocation stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Spawned,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Succeeded
                | SessionState::Failed
                | SessionState::TimedOut
                | SessionState::Cancelled
        )
    }
}

/// State machine of one spawn-to-exit lifecycle.
///
/// The first terminal state reached sticks; every later transition request
/// is refused, which keeps timeout, cancellation and exit mutually exclusive.
#[derive(Debug)]
pub struct Session {
    program: String,
    state: SessionState,
}

impl Session {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            state: SessionState::Created,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// `Created -> Spawned`
    pub fn spawned(&mut self) -> bool {
        self.transition(SessionState::Spawned, |from| from == SessionState::Created)
    }

    /// Move into a terminal state unless one was already reached
    pub fn settle(&mut self, terminal: SessionState) -> bool {
        debug_assert!(terminal.is_terminal());
        self.transition(terminal, |from| !from.is_terminal())
    }

    fn transition(&mut self, to: SessionState, allowed: impl Fn(SessionState) -> bool) -> bool {
        if !allowed(self.state) {
            debug!(program = %self.program, from = ?self.state, to = ?to, "ignoring late transition");
            return false;
        }
        debug!(program = %self.program, from = ?self.state, to = ?to, "session transition");
        self.state = to;
        true
    }
}

/// Everything a finished child produced
#[derive(Debug)]
pub struct Captured {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A child that died from a signal nobody on our side sent
pub(crate) fn killed_by_signal(status: &ExitStatus) -> bool {
    status.code().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ENV_CLIENT, ENV_PORT, ENV_USER};
    use crate::core::error::Error;

    fn config() -> Config {
        Config::builder()
            .inherit_env(false)
            .env(ENV_PORT, "localhost:1999")
            .env(ENV_USER, "bob")
            .env(ENV_CLIENT, "ws")
            .build()
            .unwrap()
    }

    #[test]
    fn test_marshal_args() {
        let args = build_args(&config(), r#"change -d "first change""#, Mode::Marshal).unwrap();
        assert_eq!(
            args,
            ["-G", "-c", "ws", "-p", "localhost:1999", "-u", "bob", "change", "-d", "first change"]
        );
    }

    #[test]
    fn test_raw_args_have_no_marshal_flag() {
        let args = build_args(&config(), "info", Mode::Raw).unwrap();
        assert_eq!(args.first().map(String::as_str), Some("-c"));
        assert_eq!(args.last().map(String::as_str), Some("info"));
    }

    #[test]
    fn test_wrapper_args_come_first() {
        let mut config = config();
        config.program_args = vec!["exec".to_string(), "box".to_string()];
        let args = build_args(&config, "info", Mode::Marshal).unwrap();
        assert_eq!(&args[..3], ["exec", "box", "-G"]);
    }

    #[test]
    fn test_unbalanced_command_fails_before_spawn() {
        let err = build_args(&config(), r#"describe "oops"#, Mode::Marshal).unwrap_err();
        assert!(matches!(err, Error::UnbalancedQuotes(_)));
    }

    #[test]
    fn test_first_terminal_state_wins() {
        let mut session = Session::new("p4");
        assert_eq!(session.state(), SessionState::Created);
        assert!(session.spawned());
        assert!(!session.spawned());

        assert!(session.settle(SessionState::TimedOut));
        assert!(!session.settle(SessionState::Succeeded));
        assert!(!session.settle(SessionState::Cancelled));
        assert_eq!(session.state(), SessionState::TimedOut);
    }

    #[test]
    fn test_launch_failure_settles_from_created() {
        let mut session = Session::new("p4");
        assert!(session.settle(SessionState::Failed));
        assert!(!session.spawned());
        assert_eq!(session.state(), SessionState::Failed);
    }
}
