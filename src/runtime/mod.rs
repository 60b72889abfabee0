//! Process execution: the async and blocking session paths, result
//! aggregation and the [`P4`] facade.

pub mod aggregate;
pub mod blocking;
pub mod client;
pub mod process;
pub mod session;


pub use aggregate::aggregate;
pub use client::{CommandHandle, P4};
pub use session::{Captured, Mode, Session, SessionState};
