use crate::core::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment key selecting the server (`-p`)
pub const ENV_PORT: &str = "P4PORT";
/// Environment key selecting the user (`-u`)
pub const ENV_USER: &str = "P4USER";
/// Environment key selecting the client workspace (`-c`)
pub const ENV_CLIENT: &str = "P4CLIENT";
/// Environment key for the connection charset; passed through untouched
pub const ENV_CHARSET: &str = "P4CHARSET";
/// Environment key holding the process timeout in milliseconds
pub const ENV_TIMEOUT: &str = "P4API_TIMEOUT";

pub const DEFAULT_PROGRAM: &str = "p4";
pub const DEFAULT_VISUAL_PROGRAM: &str = "p4vc";
/// Grace period between SIGTERM and a forced kill
pub const DEFAULT_KILL_GRACE_MS: u64 = 2000;

/// How one standard stream of the child is wired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    #[default]
    Pipe,
    Inherit,
    Null,
}

impl StreamMode {
    pub(crate) fn to_stdio(self) -> std::process::Stdio {
        match self {
            StreamMode::Pipe => std::process::Stdio::piped(),
            StreamMode::Inherit => std::process::Stdio::inherit(),
            StreamMode::Null => std::process::Stdio::null(),
        }
    }
}

/// Wiring of the child's three standard streams
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stdio {
    #[serde(default)]
    pub stdin: StreamMode,
    #[serde(default)]
    pub stdout: StreamMode,
    #[serde(default)]
    pub stderr: StreamMode,
}

/// Which marshal decoder reads stdout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarshalTier {
    /// Flat string/integer records, the shape `p4 -G` normally emits
    #[default]
    Flat,
    /// Full recursive marshal grammar (nested containers, floats, bools)
    Extended,
}

/// Launch parameters shared by every invocation made through a facade.
///
/// A `Config` is treated as an immutable snapshot: the facade swaps in a new
/// one on every options change, and each invocation reads the snapshot that
/// was current when it started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Working directory of the child; fixed once the facade is built
    pub cwd: PathBuf,
    /// Complete environment of the child (the child does not inherit anything else)
    pub env: IndexMap<String, String>,
    #[serde(default)]
    pub stdio: Stdio,
    /// Explicit timeout; when unset, `P4API_TIMEOUT` from `env` is used
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments placed before everything else, for launching `p4` through
    /// a wrapper (`wsl p4`, `docker exec box p4`, an interpreter, ...)
    #[serde(default)]
    pub program_args: Vec<String>,
    #[serde(default = "default_visual_program")]
    pub visual_program: String,
    #[serde(default)]
    pub marshal_tier: MarshalTier,
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

fn default_program() -> String {
    DEFAULT_PROGRAM.to_string()
}

fn default_visual_program() -> String {
    DEFAULT_VISUAL_PROGRAM.to_string()
}

fn default_kill_grace_ms() -> u64 {
    DEFAULT_KILL_GRACE_MS
}

impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::new().assemble()
    }
}

impl Config {
    /// Create a new config builder for fluent configuration
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Look up a key in the child's environment, ignoring empty values
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Effective process timeout; zero, absent or unparsable means none
    pub fn timeout(&self) -> Option<Duration> {
        let ms = match self.timeout_ms {
            Some(ms) => ms,
            None => self
                .env_var(ENV_TIMEOUT)
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .unwrap_or(0),
        };
        (ms > 0).then(|| Duration::from_millis(ms))
    }

    /// Connection flags prepended to every `p4` invocation.
    ///
    /// They force the connection from the environment so that a `P4CONFIG`
    /// file found under `cwd` cannot override it.
    pub fn global_flags(&self) -> Vec<String> {
        self.connection_flags(&[("-c", ENV_CLIENT), ("-p", ENV_PORT), ("-u", ENV_USER)])
    }

    /// Connection flags for the visual client, which expects port first
    pub fn visual_flags(&self) -> Vec<String> {
        self.connection_flags(&[("-p", ENV_PORT), ("-u", ENV_USER), ("-c", ENV_CLIENT)])
    }

    fn connection_flags(&self, order: &[(&str, &str)]) -> Vec<String> {
        let mut flags = Vec::new();
        for (flag, key) in order {
            if let Some(value) = self.env_var(key) {
                flags.push((*flag).to_string());
                flags.push(value.to_string());
            }
        }
        flags
    }

    /// Produce the next snapshot with `options` applied.
    ///
    /// `Replace` swaps every provided field wholesale. `Merge` merges the
    /// environment key by key and replaces scalars. A `cwd` in `options` is
    /// rejected and nothing is applied.
    pub fn with_options(&self, options: &Options, mode: MergeMode) -> Result<Config> {
        if options.cwd.is_some() {
            return Err(Error::configuration(
                "the working directory is fixed at construction and cannot be changed through options",
            ));
        }

        let mut next = self.clone();
        if let Some(env) = &options.env {
            match mode {
                MergeMode::Replace => next.env = env.clone(),
                MergeMode::Merge => {
                    for (key, value) in env {
                        next.env.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        if let Some(stdio) = options.stdio {
            next.stdio = stdio;
        }
        if let Some(timeout_ms) = options.timeout_ms {
            next.timeout_ms = Some(timeout_ms);
        }
        if let Some(program) = &options.program {
            next.program = program.clone();
        }
        if let Some(program_args) = &options.program_args {
            next.program_args = program_args.clone();
        }
        if let Some(visual_program) = &options.visual_program {
            next.visual_program = visual_program.clone();
        }
        if let Some(tier) = options.marshal_tier {
            next.marshal_tier = tier;
        }
        if let Some(grace) = options.kill_grace_ms {
            next.kill_grace_ms = grace;
        }

        next.validate()?;
        Ok(next)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if a program name is empty
    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(Error::configuration("program must not be empty"));
        }
        if self.visual_program.trim().is_empty() {
            return Err(Error::configuration("visual program must not be empty"));
        }
        Ok(())
    }
}

/// How [`Config::with_options`] treats mapping-valued options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    Replace,
    Merge,
}

/// A partial configuration update for `set_opts`/`add_opts`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Always rejected; present so that attempts are reported instead of ignored
    pub cwd: Option<PathBuf>,
    pub env: Option<IndexMap<String, String>>,
    pub stdio: Option<Stdio>,
    pub timeout_ms: Option<u64>,
    pub program: Option<String>,
    pub program_args: Option<Vec<String>>,
    pub visual_program: Option<String>,
    pub marshal_tier: Option<MarshalTier>,
    pub kill_grace_ms: Option<u64>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one environment entry to the update
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(IndexMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn stdio(mut self, stdio: Stdio) -> Self {
        self.stdio = Some(stdio);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn program_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.program_args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    pub fn visual_program(mut self, program: impl Into<String>) -> Self {
        self.visual_program = Some(program.into());
        self
    }

    pub fn marshal_tier(mut self, tier: MarshalTier) -> Self {
        self.marshal_tier = Some(tier);
        self
    }

    pub fn kill_grace_ms(mut self, grace_ms: u64) -> Self {
        self.kill_grace_ms = Some(grace_ms);
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Builder for [`Config`]
///
/// The child's environment is the process environment (unless
/// `inherit_env(false)`), then the explicit entries, then `PWD` set to the
/// working directory.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    cwd: Option<PathBuf>,
    env: IndexMap<String, String>,
    inherit_env: bool,
    stdio: Stdio,
    timeout_ms: Option<u64>,
    program: String,
    program_args: Vec<String>,
    visual_program: String,
    marshal_tier: MarshalTier,
    kill_grace_ms: u64,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            cwd: None,
            env: IndexMap::new(),
            inherit_env: true,
            stdio: Stdio::default(),
            timeout_ms: None,
            program: default_program(),
            program_args: Vec::new(),
            visual_program: default_visual_program(),
            marshal_tier: MarshalTier::default(),
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
        }
    }

    /// Working directory of every invocation (defaults to the current directory)
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set one environment entry, e.g. `env("P4PORT", "ssl:perforce:1666")`
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in vars {
            self.env.insert(key.into(), value.into());
        }
        self
    }

    /// Whether the child starts from this process's environment (default: true)
    pub fn inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    pub fn stdio(mut self, stdio: Stdio) -> Self {
        self.stdio = stdio;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn program_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.program_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn visual_program(mut self, program: impl Into<String>) -> Self {
        self.visual_program = program.into();
        self
    }

    pub fn marshal_tier(mut self, tier: MarshalTier) -> Self {
        self.marshal_tier = tier;
        self
    }

    pub fn kill_grace_ms(mut self, grace_ms: u64) -> Self {
        self.kill_grace_ms = grace_ms;
        self
    }

    /// Build the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid
    pub fn build(self) -> Result<Config> {
        let config = self.assemble();
        config.validate()?;
        Ok(config)
    }

    fn assemble(self) -> Config {
        let cwd = self
            .cwd
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let mut env: IndexMap<String, String> = if self.inherit_env {
            std::env::vars().collect()
        } else {
            IndexMap::new()
        };
        env.extend(self.env);
        env.insert("PWD".to_string(), cwd.to_string_lossy().into_owned());

        Config {
            cwd,
            env,
            stdio: self.stdio,
            timeout_ms: self.timeout_ms,
            program: self.program,
            program_args: self.program_args,
            visual_program: self.visual_program,
            marshal_tier: self.marshal_tier,
            kill_grace_ms: self.kill_grace_ms,
        }
    }
}
