//! Observability for the coordination daemon and CLI.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Spans**: one operation span per daemon sweep, tagged with a trace id
//! - **Metrics**: in-process counters, gauges and histograms with Prometheus
//!   text export

pub mod logging;
pub mod metrics;
pub mod tracing_setup;
