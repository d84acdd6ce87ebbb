use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "baykeeper_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "baykeeper_query_duration_seconds";

// ── Resource metrics ────────────────────────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "baykeeper_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "baykeeper_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "baykeeper_connections_rejected_total";

/// Gauge: garages currently loaded.
pub const GARAGES_ACTIVE: &str = "baykeeper_garages_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "baykeeper_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "baykeeper_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "baykeeper_wal_compactions_total";

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: reservations confirmed onto a bay.
pub const RESERVATIONS_CONFIRMED_TOTAL: &str = "baykeeper_reservations_confirmed_total";

/// Counter: confirmations refused. Labels: reason.
pub const CONFIRMATIONS_REJECTED_TOTAL: &str = "baykeeper_confirmations_rejected_total";

/// Counter: reservations cancelled by the system. Labels: cause.
pub const CASCADE_CANCELLATIONS_TOTAL: &str = "baykeeper_cascade_cancellations_total";

/// Counter: notifications the dispatcher failed to deliver.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "baykeeper_notifications_failed_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertGarage { .. } => "insert_garage",
        Command::UpdateGarage { .. } => "resize_garage",
        Command::DeleteGarage { .. } => "delete_garage",
        Command::SelectGarages { .. } => "select_garages",
        Command::ToggleBay { .. } => "toggle_bay",
        Command::DeleteBayRange { .. } => "delete_bay_range",
        Command::SelectBays { .. } => "select_bays",
        Command::SelectAvailableBays { .. } => "select_available_bays",
        Command::InsertReservation(_) => "insert_reservation",
        Command::UpdateReservationStatus { .. } => "update_reservation_status",
        Command::SelectReservation { .. } => "select_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectNotifications { .. } => "select_notifications",
    }
}
