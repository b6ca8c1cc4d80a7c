//! Observability module for logging and health checks

pub mod health;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use health::{
    check_health_via_client, check_health_via_http, create_health_check_interval, is_server_available,
    ComponentHealth, HealthCheckFn, HealthMonitor, HealthStatus, HttpHealth, MonitorState, ServiceHealth,
};

/// Initialize logging and tracing
pub fn init_observability(log_level: &str, format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}
