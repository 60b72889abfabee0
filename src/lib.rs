//! # p4-sdk-rs
//!
//! Drive the `p4` command-line tool through its marshalled (`-G`) interchange
//! mode. Requests are encoded onto the child's stdin, replies are decoded
//! into [`Record`]s and folded into a [`P4Result`], with timeouts and
//! cancellation enforced around the process.
//!
//! ```rust,no_run
//! use p4_sdk_rs::{Config, P4};
//!
//! # fn main() -> p4_sdk_rs::Result<()> {
//! let p4 = P4::new(Config::builder().env("P4PORT", "localhost:1666").build()?);
//! let info = p4.cmd_sync("info", None)?;
//! println!("{:?}", info.info());
//! # Ok(())
//! # }
//! ```
//!
//! Failures reported by `p4` itself are data: they show up in
//! [`P4Result::error`]. Only transport problems (launch failure, timeout,
//! cancellation) are returned as [`Error`].

pub mod codec;
pub mod core;
pub mod runtime;

#[cfg(feature = "cli")]
pub mod cli;

pub use crate::codec::{decode, decode_extended, encode, Decoded};
pub use crate::core::{
    tokenize, Config, ConfigBuilder, Error, MarshalTier, Options, P4Result, Payload, RawOutput,
    Record, Result, Value,
};
pub use crate::runtime::{CommandHandle, P4};

/// Version information for the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
