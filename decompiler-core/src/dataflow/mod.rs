//! Per-function dataflow (§4.5, component E).

mod analyzer;
mod reaching;
mod value;

pub use analyzer::{analyze, analyze_with_callbacks, CallbackHandler, DataflowResult};
pub use reaching::{Definition, ReachingDefinitions};
pub use value::AbstractValue;
