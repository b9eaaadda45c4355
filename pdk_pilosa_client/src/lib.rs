//! Client for the Pilosa HTTP API.
//!
//! Only the calls needed to load data are implemented: creating indexes and
//! fields, and importing bits and integer values.
mod client;
mod error;
pub mod proto;
mod sink;

pub use self::{
    client::{FieldOptions, IndexOptions, PilosaClient},
    error::{PilosaError, Result},
    sink::{Import, PilosaSink, field_options, translate_batch},
};
