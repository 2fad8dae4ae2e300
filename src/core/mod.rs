pub mod cards;
pub mod chat_stream;
pub mod coalesce;
pub mod config;
pub mod constants;
pub mod engine;
pub mod message;
pub mod reconciler;
pub mod reducer;
pub mod router;
pub mod session;
