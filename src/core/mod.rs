//! Types, configuration, errors and command tokenizing shared by the codec
//! and the runtime.

pub mod config;
pub mod error;
pub mod tokenize;
pub mod types;

pub use config::{Config, ConfigBuilder, MarshalTier, MergeMode, Options, Stdio, StreamMode};
pub use error::{Error, Result};
pub use tokenize::tokenize;
pub use types::{generic, severity, P4Result, Payload, RawOutput, Record, Value};
