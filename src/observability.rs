use std::net::SocketAddr;

/// Gauge: images currently tracked in the registry.
pub const IMAGES_TRACKED: &str = "caduc_images_tracked";

/// Gauge: containers currently tracked in the registry.
pub const CONTAINERS_TRACKED: &str = "caduc_containers_tracked";

/// Gauge: delete timers currently armed.
pub const TIMERS_ARMED: &str = "caduc_timers_armed";

/// Counter: engine events handled. Labels: action.
pub const EVENTS_TOTAL: &str = "caduc_events_total";

/// Counter: image removal attempts. Labels: status.
pub const REMOVALS_TOTAL: &str = "caduc_image_removals_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
