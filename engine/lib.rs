//! `qorm-engine`: the runtime that turns a loaded schema into a live database client —
//! plan compilation, SQL dialects, transaction handling, and the plugin-hookable CRUD
//! surface a generated client calls into.

pub mod client;
pub mod coerce;
pub mod conn;
pub mod ctx;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod find;
pub mod layout;
pub mod mutate;
pub mod plugin;
pub mod pusher;
pub mod qutils;
pub mod query;
pub mod result;
pub mod sql_writer;
pub mod validate;
pub mod visit;

pub use client::Client;
pub use error::{EngineError, Result};
