//! kcell - run regions of a text buffer as code cells against Jupyter kernels.
//!
//! A [`session::Session`] owns every running kernel and the buffers attached
//! to them. Each kernel gets a [`coordinator::KernelCoordinator`] that queues
//! cell executions in FIFO order and feeds the kernel's messages into the
//! cell outputs. Nothing blocks: the host calls [`session::Session::tick`] on
//! a timer and every tick drains only the messages already received.
//!
//! The editor is reached through two capabilities: [`position::TextHost`]
//! for anchors that follow text edits, and [`surface::Surface`] for panels,
//! virtual lines, highlights and notifications. [`headless::HeadlessHost`]
//! implements both in memory for the `kcell` binary and for tests.

pub mod cell;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod headless;
pub mod history;
pub mod ipynb;
pub mod message;
pub mod mimetype;
pub mod output;
pub mod position;
pub mod runtime;
pub mod save;
pub mod session;
pub mod surface;
pub mod transport;
pub mod view;

#[cfg(test)]
mod test_support;

pub use error::{SessionError, SessionResult};
pub use session::Session;
