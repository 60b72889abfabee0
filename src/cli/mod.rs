//! Command-line front end over [`P4`](crate::P4), printing replies as JSON.
//!
//! ## Usage
//!
//! ```bash
//! # Aggregated reply of `p4 -G info`
//! p4-sdk-rs -p localhost:1666 -u bob info
//!
//! # Plain-text invocation, blocking driver
//! p4-sdk-rs --raw --sync changes -m 5
//!
//! # Marshalled input: a spec form built from fields
//! p4-sdk-rs --field Change=new --field "Description=fix build" change -i
//! ```

pub mod app;

pub use app::Cli;
