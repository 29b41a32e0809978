use std::net::SocketAddr;

use crate::sql::Command;

// ── Requests ─────────────────────────────────────────────────────

/// Counter: SQL commands executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: SQL command latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

// ── Reservations ─────────────────────────────────────────────────

/// Counter: reservations committed.
pub const RESERVATIONS_COMMITTED_TOTAL: &str = "slotbook_reservations_committed_total";

/// Counter: create/update requests refused. Labels: reason.
pub const RESERVATIONS_REJECTED_TOTAL: &str = "slotbook_reservations_rejected_total";

/// Counter: reservations cancelled (repeat cancels not counted).
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "slotbook_reservations_cancelled_total";

/// Counter: availability queries served.
pub const AVAILABILITY_QUERIES_TOTAL: &str = "slotbook_availability_queries_total";

/// Histogram: time spent waiting for a resource write lock, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "slotbook_lock_wait_seconds";

/// Counter: writes that gave up waiting for a resource lock.
pub const LOCK_TIMEOUTS_TOTAL: &str = "slotbook_lock_timeouts_total";

// ── Connections and storage ──────────────────────────────────────

/// Gauge: open client connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections refused at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Gauge: loaded tenants.
pub const TENANTS_ACTIVE: &str = "slotbook_tenants_active";

/// Counter: failed startups (bad password, unknown tenant).
pub const AUTH_FAILURES_TOTAL: &str = "slotbook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: events per WAL group commit.
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op when `port` is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metric label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertResource { .. } => "insert_resource",
        Command::UpdateResource { .. } => "update_resource",
        Command::DeleteResource { .. } => "delete_resource",
        Command::SelectResources => "select_resources",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectFreeWindows { .. } => "select_free_windows",
        Command::SelectReservations { .. } => "select_reservations",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
