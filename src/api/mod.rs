//! API layer - HTTP endpoint handlers.

mod health;
mod metrics;
mod notifications;
mod routes;

pub use health::{health, stats};
pub use metrics::prometheus_metrics;
pub use notifications::{enqueue_notification, EnqueueNotificationResponse};
pub use routes::api_routes;
