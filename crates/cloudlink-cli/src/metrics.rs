//! Metrics collection and export for the cloudlink client.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use cloudlink_core::{CloudEvent, CloudSession, EventKind, Handler};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTS_TOTAL: &str = "cloudlink_connects_total";
    pub const DISCONNECTS_TOTAL: &str = "cloudlink_disconnects_total";
    pub const RECONNECTS_TOTAL: &str = "cloudlink_reconnects_total";
    pub const CONNECTED: &str = "cloudlink_connected";
    pub const OUTGOING_TOTAL: &str = "cloudlink_outgoing_total";
    pub const INBOUND_SETS_TOTAL: &str = "cloudlink_inbound_sets_total";
    pub const CHANGES_TOTAL: &str = "cloudlink_changes_total";
    pub const VARIABLES: &str = "cloudlink_variables";
    pub const ERRORS_TOTAL: &str = "cloudlink_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTS_TOTAL,
        "Number of completed handshakes since start"
    );
    metrics::describe_counter!(names::DISCONNECTS_TOTAL, "Number of dropped connections");
    metrics::describe_counter!(
        names::RECONNECTS_TOTAL,
        "Number of successful reconnections"
    );
    metrics::describe_gauge!(names::CONNECTED, "1 while the session is synced");
    metrics::describe_counter!(
        names::OUTGOING_TOTAL,
        "Mutation packets written, by method"
    );
    metrics::describe_counter!(
        names::INBOUND_SETS_TOTAL,
        "Values pushed by the server"
    );
    metrics::describe_counter!(names::CHANGES_TOTAL, "Local and remote value changes");
    metrics::describe_gauge!(names::VARIABLES, "Variables in the local store");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record session activity for every event `session` emits.
pub fn observe(session: &CloudSession) {
    let tracked = session.downgrade();
    let recorder = Handler::sync(move |event: &CloudEvent| {
        record_event(event);
        if let Some(session) = tracked.upgrade() {
            set_variable_count(session.len());
        }
    });

    for kind in [
        EventKind::Connect,
        EventKind::Disconnect,
        EventKind::Reconnect,
        EventKind::Outgoing,
        EventKind::Set,
        EventKind::Change,
        EventKind::Delete,
    ] {
        session.on(kind, recorder.clone());
    }
}

/// Record a single session event.
pub fn record_event(event: &CloudEvent) {
    match event {
        CloudEvent::Connect => {
            counter!(names::CONNECTS_TOTAL).increment(1);
            gauge!(names::CONNECTED).set(1.0);
        }
        CloudEvent::Disconnect(_) => {
            counter!(names::DISCONNECTS_TOTAL).increment(1);
            gauge!(names::CONNECTED).set(0.0);
        }
        CloudEvent::Reconnect => {
            counter!(names::RECONNECTS_TOTAL).increment(1);
        }
        CloudEvent::Outgoing(packet) => {
            counter!(names::OUTGOING_TOTAL, "method" => packet.method()).increment(1);
        }
        CloudEvent::Set(_) => {
            counter!(names::INBOUND_SETS_TOTAL).increment(1);
        }
        CloudEvent::Change(_) => {
            counter!(names::CHANGES_TOTAL).increment(1);
        }
        CloudEvent::Handshake | CloudEvent::Create(_) | CloudEvent::Delete(_) => {}
    }
}

/// Update the store size gauge.
pub fn set_variable_count(count: usize) {
    gauge!(names::VARIABLES).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}
