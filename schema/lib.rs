#[macro_use]
mod serde_with;

pub mod expr;
pub mod schema;
pub mod typecheck;

pub use schema::*;
