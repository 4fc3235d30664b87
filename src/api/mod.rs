//! API endpoint modules.

pub mod cluster;
pub mod health;
pub mod openapi;

pub use cluster::configure_cluster_routes;
pub use health::configure_health_routes;
pub use openapi::{ApiDoc, configure_openapi_routes};
