//! Collaborators the orchestrator drives: the cluster, the chart registry
//! and the static payload server.

pub mod cluster;
pub mod payload;
pub mod registry;

pub use cluster::{parse_pod_list, Cluster, PodStatus};
pub use payload::{discover_host_address, PayloadClient, ROUTE_PROBE};
pub use registry::{is_listed, parse_chart_listing, ChartEntry, ChartRegistry, HttpChartRegistry};

#[cfg(test)]
pub use registry::MockChartRegistry;
