//! Framehouse Observability
//!
//! Prometheus metrics for the storage engine and the HTTP router that
//! exposes them.
//!
//! # Usage
//!
//! ```no_run
//! use framehouse_observability::{exporter, metrics};
//!
//! metrics::init();
//! let router = exporter::create_metrics_router();
//! ```

pub mod exporter;
pub mod metrics;

pub use metrics::{init as init_metrics, REGISTRY};

/// Initialize all observability components
pub fn init() {
    metrics::init();
}
