//! Streamturn is the conversation session engine behind an agent chat client.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`api`] defines the server's wire types and the [`api::client::ConversationApi`]
//!   seam with its HTTP implementation.
//! - [`core`] owns the session state machine: the timeline, the event applier,
//!   the coalescing queue, side-effect routing, and post-stream reconciliation.
//! - [`runtime`] drives the engine on tokio, executing its commands and
//!   broadcasting notices to UI code.
//! - [`utils`] holds logging setup and URL helpers.
//!
//! Applications build a [`runtime::SessionRuntime`] with
//! [`runtime::SessionRuntime::connect`] and talk to it from their UI loop.

pub mod api;
pub mod core;
pub mod runtime;
pub mod utils;
