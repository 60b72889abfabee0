use crate::codec::{decode_with, encode_to_vec};
use crate::core::config::{Config, MergeMode, Options};
use crate::core::error::Result;
use crate::core::types::{P4Result, Payload, RawOutput};
use crate::runtime::aggregate::aggregate;
use crate::runtime::session::{Captured, Mode};
use crate::runtime::{blocking, process};
use parking_lot::RwLock;
use std::process::ExitStatus;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Facade over the `p4` command-line tool
///
/// `P4` holds the launch configuration and runs commands through `p4 -G`,
/// either awaiting them or blocking the calling thread. Each invocation takes
/// a snapshot of the configuration when it starts, so changing options while
/// commands are in flight only affects later invocations.
///
/// # Examples
///
/// ```rust,no_run
/// # use p4_sdk_rs::{Config, P4, Payload};
/// # #[tokio::main]
/// # async fn main() -> p4_sdk_rs::Result<()> {
/// let p4 = P4::new(
///     Config::builder()
///         .env("P4PORT", "localhost:1666")
///         .env("P4USER", "bob")
///         .timeout_ms(5000)
///         .build()?,
/// );
///
/// let result = p4.cmd("login", Some(Payload::from("thePassword"))).await?;
/// if result.has_errors() {
///     println!("login refused: {:?}", result.error());
/// }
///
/// let depots = p4.cmd("depots", None).await?;
/// for depot in depots.stat().unwrap_or_default() {
///     println!("{:?}", depot.get_str("name"));
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct P4 {
    config: RwLock<Arc<Config>>,
}

impl Default for P4 {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl P4 {
    /// Create a facade with the given configuration
    pub fn new(config: Config) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
        }
    }

    /// Create a facade from the process environment plus `vars`
    /// (`P4PORT`, `P4USER`, `P4CLIENT`, `P4API_TIMEOUT`, ...)
    pub fn with_env<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Ok(Self::new(Config::builder().envs(vars).build()?))
    }

    /// The configuration snapshot the next invocation will use
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.read())
    }

    /// Connection flags derived from the current environment
    pub fn global_flags(&self) -> Vec<String> {
        self.config().global_flags()
    }

    /// Replace each provided option wholesale (the environment included).
    ///
    /// # Errors
    ///
    /// Returns a configuration error, and changes nothing, if `options`
    /// tries to change the working directory.
    pub fn set_opts(&self, options: Options) -> Result<()> {
        self.update(&options, MergeMode::Replace)
    }

    /// Merge the provided options: environment entries are added or
    /// overwritten one by one, other options are replaced.
    ///
    /// # Errors
    ///
    /// Same as [`set_opts`](Self::set_opts).
    pub fn add_opts(&self, options: Options) -> Result<()> {
        self.update(&options, MergeMode::Merge)
    }

    fn update(&self, options: &Options, mode: MergeMode) -> Result<()> {
        let mut guard = self.config.write();
        let next = guard.with_options(options, mode)?;
        *guard = Arc::new(next);
        Ok(())
    }

    /// Run `command` through `p4 -G` and aggregate its reply.
    ///
    /// Dropping the returned future kills the child.
    pub async fn cmd(&self, command: &str, input: Option<Payload>) -> Result<P4Result> {
        run_cmd(self.config(), command.to_string(), input, CancellationToken::new()).await
    }

    /// [`cmd`](Self::cmd) that also stops when `cancel` fires, settling as
    /// [`Error::Cancelled`](crate::Error::Cancelled)
    pub async fn cmd_with_cancel(
        &self,
        command: &str,
        input: Option<Payload>,
        cancel: CancellationToken,
    ) -> Result<P4Result> {
        run_cmd(self.config(), command.to_string(), input, cancel).await
    }

    /// Start `command` on the runtime and return a cancellable handle.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn_cmd(&self, command: impl Into<String>, input: Option<Payload>) -> CommandHandle<P4Result> {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_cmd(self.config(), command.into(), input, cancel.clone()));
        CommandHandle { cancel, task }
    }

    /// Blocking form of [`cmd`](Self::cmd); the input is encoded into a
    /// buffer before the process starts.
    pub fn cmd_sync(&self, command: &str, input: Option<Payload>) -> Result<P4Result> {
        let config = self.config();
        let stdin = encode_input(input.as_ref())?;
        let captured = blocking::execute(&config, command, stdin, Mode::Marshal)?;
        Ok(finish(&config, command, captured))
    }

    /// Run `command` without `-G`, exchanging plain text
    pub async fn raw_cmd(&self, command: &str, input: Option<&str>) -> Result<RawOutput> {
        run_raw(
            self.config(),
            command.to_string(),
            input.map(str::to_string),
            CancellationToken::new(),
        )
        .await
    }

    /// Cancellable form of [`raw_cmd`](Self::raw_cmd) running on the runtime
    pub fn spawn_raw_cmd(&self, command: impl Into<String>, input: Option<String>) -> CommandHandle<RawOutput> {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_raw(self.config(), command.into(), input, cancel.clone()));
        CommandHandle { cancel, task }
    }

    /// Blocking form of [`raw_cmd`](Self::raw_cmd)
    pub fn raw_cmd_sync(&self, command: &str, input: Option<&str>) -> Result<RawOutput> {
        let config = self.config();
        let stdin = input.filter(|text| !text.is_empty()).map(|text| text.as_bytes().to_vec());
        let captured = blocking::execute(&config, command, stdin, Mode::Raw)?;
        Ok(raw_output(captured))
    }

    /// Open the visual client on `command` and wait for it to close
    pub async fn visual(&self, command: &str) -> Result<ExitStatus> {
        process::launch_visual(&self.config(), command).await
    }
}

/// A command running on the Tokio runtime
///
/// Cancelling terminates the child; the handle then resolves to
/// [`Error::Cancelled`](crate::Error::Cancelled), never to a result.
#[derive(Debug)]
pub struct CommandHandle<T> {
    cancel: CancellationToken,
    task: JoinHandle<Result<T>>,
}

impl<T> CommandHandle<T> {
    /// Request cancellation; a no-op once the command has settled
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this command when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the command to settle
    pub async fn join(self) -> Result<T> {
        self.task.await?
    }
}

async fn run_cmd(
    config: Arc<Config>,
    command: String,
    input: Option<Payload>,
    cancel: CancellationToken,
) -> Result<P4Result> {
    let stdin = encode_input(input.as_ref())?;
    let captured = process::execute(&config, &command, stdin, Mode::Marshal, cancel).await?;
    Ok(finish(&config, &command, captured))
}

async fn run_raw(
    config: Arc<Config>,
    command: String,
    input: Option<String>,
    cancel: CancellationToken,
) -> Result<RawOutput> {
    let stdin = input.filter(|text| !text.is_empty()).map(String::into_bytes);
    let captured = process::execute(&config, &command, stdin, Mode::Raw, cancel).await?;
    Ok(raw_output(captured))
}

fn encode_input(input: Option<&Payload>) -> Result<Option<Vec<u8>>> {
    match input {
        Some(payload) if payload.should_write() => Ok(Some(encode_to_vec(payload)?)),
        _ => Ok(None),
    }
}

fn finish(config: &Config, command: &str, captured: Captured) -> P4Result {
    let decoded = decode_with(config.marshal_tier, &captured.stdout);
    aggregate(command, decoded, &captured.stderr)
}

fn raw_output(captured: Captured) -> RawOutput {
    RawOutput {
        text: String::from_utf8_lossy(&captured.stdout).into_owned(),
        error: String::from_utf8_lossy(&captured.stderr).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ENV_PORT, ENV_USER};
    use crate::core::error::Error;

    fn facade() -> P4 {
        P4::new(
            Config::builder()
                .inherit_env(false)
                .cwd("/tmp")
                .env(ENV_PORT, "localhost:1999")
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_add_opts_merges_env() {
        let p4 = facade();
        p4.add_opts(Options::new().env(ENV_USER, "bob")).unwrap();
        assert_eq!(p4.global_flags(), ["-p", "localhost:1999", "-u", "bob"]);
    }

    #[test]
    fn test_set_opts_replaces_env() {
        let p4 = facade();
        p4.set_opts(Options::new().env(ENV_USER, "bob")).unwrap();
        assert_eq!(p4.global_flags(), ["-u", "bob"]);
    }

    #[test]
    fn test_cwd_rejected_and_nothing_applied() {
        let p4 = facade();
        let err = p4
            .add_opts(Options::new().cwd("/elsewhere").env(ENV_USER, "bob"))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(p4.global_flags(), ["-p", "localhost:1999"]);
        assert_eq!(p4.config().cwd, std::path::PathBuf::from("/tmp"));
    }

    #[test]
    fn test_snapshots_are_copy_on_write() {
        let p4 = facade();
        let before = p4.config();
        p4.add_opts(Options::new().timeout_ms(1000)).unwrap();
        assert_eq!(before.timeout_ms, None);
        assert_eq!(p4.config().timeout_ms, Some(1000));
    }

    #[test]
    fn test_encode_input_skips_empty_text() {
        assert_eq!(encode_input(None).unwrap(), None);
        assert_eq!(encode_input(Some(&Payload::from(""))).unwrap(), None);
        assert_eq!(
            encode_input(Some(&Payload::from("pw"))).unwrap(),
            Some(b"pw".to_vec())
        );
        assert_eq!(encode_input(Some(&Payload::map())).unwrap(), Some(b"{0".to_vec()));
    }
}
