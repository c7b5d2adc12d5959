mod correlation;
pub use correlation::{CorrelationLayer, CorrelationService};
