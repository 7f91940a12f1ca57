pub mod errors;
pub mod gains;
pub mod telemetry;

pub use errors::*;
pub use gains::*;
pub use telemetry::*;
