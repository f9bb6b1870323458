//! Chainwatch client library.
//!
//! Follows resource chains through the watch endpoint. A [`poll::Watcher`]
//! owns one resource's position and advances it only when the server hands
//! back a newer cursor; the HTTP layer sits behind
//! [`transport::WatchTransport`] so the loop runs the same against a real
//! server or a scripted one.

pub mod config;
pub mod describe;
pub mod error;
pub mod filter;
pub mod poll;
pub mod transport;

pub use error::ClientError;
pub use filter::{EventFilter, FilterError};
pub use poll::{Batch, PollOutcome, WatchSettings, WatchStart, WatchState, Watcher};
pub use transport::{HttpTransport, WatchTransport};
