use crate::core::config::{Config, MarshalTier, ENV_CLIENT, ENV_PORT, ENV_USER};
use crate::core::error::{Error, Result};
use crate::core::types::Payload;
use crate::runtime::client::P4;
use clap::Parser;
use serde::Serialize;
use tracing::{debug, info};

/// Run p4 commands through the marshalled interface and print the reply as JSON
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Server address, passed as `-p`
    #[arg(short = 'p', long, env = ENV_PORT)]
    pub port: Option<String>,

    /// User name, passed as `-u`
    #[arg(short = 'u', long, env = ENV_USER)]
    pub user: Option<String>,

    /// Client workspace, passed as `-c`
    #[arg(short = 'c', long, env = ENV_CLIENT)]
    pub client: Option<String>,

    /// Kill p4 after this many milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// The p4 executable
    #[arg(long, default_value = crate::core::config::DEFAULT_PROGRAM)]
    pub program: String,

    /// Exchange plain text instead of marshalled records
    #[arg(long)]
    pub raw: bool,

    /// Use the blocking driver instead of the async one
    #[arg(long)]
    pub sync: bool,

    /// Decode with the full marshal grammar (nested values, floats)
    #[arg(long)]
    pub extended: bool,

    /// Text written to p4's stdin (a password, a raw form)
    #[arg(long, conflicts_with = "fields")]
    pub input: Option<String>,

    /// KEY=VALUE field of a marshalled input form; repeatable
    #[arg(long = "field", value_parser = parse_field)]
    pub fields: Vec<(String, String)>,

    /// Pretty-print the JSON reply
    #[arg(long)]
    pub pretty: bool,

    /// The p4 command and its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Cli {
    /// Execute the invocation and print its reply
    pub async fn execute(self) -> Result<()> {
        let config = self.config()?;
        let command = join_command(&self.command);
        info!(%command, raw = self.raw, sync = self.sync, "running p4");

        let json = if self.raw {
            let output = if self.sync {
                let input = self.input.clone();
                tokio::task::spawn_blocking(move || {
                    P4::new(config).raw_cmd_sync(&command, input.as_deref())
                })
                .await??
            } else {
                let p4 = P4::new(config);
                let handle = p4.spawn_raw_cmd(command, self.input.clone());
                cancel_on_ctrl_c(handle.cancellation_token());
                handle.join().await?
            };
            self.render(&output)?
        } else {
            let input = self.payload();
            let result = if self.sync {
                tokio::task::spawn_blocking(move || P4::new(config).cmd_sync(&command, input)).await??
            } else {
                let p4 = P4::new(config);
                let handle = p4.spawn_cmd(command, input);
                cancel_on_ctrl_c(handle.cancellation_token());
                handle.join().await?
            };
            self.render(&result)?
        };

        println!("{}", json);
        Ok(())
    }

    /// Launch configuration built from the process environment and the flags
    pub fn config(&self) -> Result<Config> {
        let mut builder = Config::builder().program(self.program.as_str());
        for (key, value) in [
            (ENV_PORT, &self.port),
            (ENV_USER, &self.user),
            (ENV_CLIENT, &self.client),
        ] {
            if let Some(value) = value {
                builder = builder.env(key, value.as_str());
            }
        }
        if let Some(timeout_ms) = self.timeout_ms {
            builder = builder.timeout_ms(timeout_ms);
        }
        if self.extended {
            builder = builder.marshal_tier(MarshalTier::Extended);
        }
        builder.build()
    }

    /// Input for a marshalled command: a form when fields were given,
    /// otherwise the free text, if any
    pub fn payload(&self) -> Option<Payload> {
        if !self.fields.is_empty() {
            return Some(self.fields.iter().cloned().collect());
        }
        self.input.clone().map(Payload::from)
    }

    fn render<T: Serialize>(&self, value: &T) -> Result<String> {
        let json = if self.pretty {
            serde_json::to_string_pretty(value)?
        } else {
            serde_json::to_string(value)?
        };
        Ok(json)
    }
}

fn cancel_on_ctrl_c(token: tokio_util::sync::CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupted; cancelling p4");
            token.cancel();
        }
    });
}

/// Rejoin shell words into one command line, re-quoting words that contain
/// whitespace so they survive tokenizing
pub fn join_command(words: &[String]) -> String {
    words
        .iter()
        .map(|word| {
            if word.is_empty() || word.chars().any(char::is_whitespace) {
                format!("\"{}\"", word)
            } else {
                word.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_field(raw: &str) -> std::result::Result<(String, String), Error> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(Error::configuration(format!("expected KEY=VALUE, got '{}'", raw))),
    }
}
