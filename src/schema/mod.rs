//! Schema changes: the [`TableBuilder`] API and the text [`Request`] form
//! that drives it.

mod builder;
pub mod request;

pub use builder::TableBuilder;
pub use request::{IndexSpec, Request, SchemaSpec};
