mod metrics_layer;
mod token;
mod tracing_layer;

pub use metrics_layer::*;
pub use token::*;
pub use tracing_layer::*;
