use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "salonbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "salonbook_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: appointments booked.
pub const BOOKINGS_TOTAL: &str = "salonbook_bookings_total";

/// Counter: bookings or reschedules refused because the slot was taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "salonbook_booking_conflicts_total";

/// Counter: reminder notifications recorded by the background sweep.
pub const REMINDERS_SENT_TOTAL: &str = "salonbook_reminders_sent_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "salonbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "salonbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "salonbook_connections_rejected_total";

/// Gauge: number of loaded tenants (one engine + WAL each).
pub const TENANTS_ACTIVE: &str = "salonbook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "salonbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "salonbook_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertBusiness { .. } => "insert_business",
        Command::UpdateBusiness { .. } => "update_business",
        Command::InsertStaff { .. } => "insert_staff",
        Command::UpdateStaffSchedule { .. } => "update_staff_schedule",
        Command::InsertService { .. } => "insert_service",
        Command::UpdateService { .. } => "update_service",
        Command::DeleteService { .. } => "delete_service",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::RescheduleAppointment { .. } => "reschedule_appointment",
        Command::UpdateAppointmentStatus { .. } => "update_appointment_status",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::InsertFeedback { .. } => "insert_feedback",
        Command::InsertNotification { .. } => "insert_notification",
        Command::MarkNotificationRead { .. } => "mark_notification_read",
        Command::InsertPayment { .. } => "insert_payment",
        Command::UpdatePayment { .. } => "update_payment",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectConflict { .. } => "select_conflict",
        Command::SelectServices { .. } => "select_services",
        Command::SelectRatings { .. } => "select_ratings",
        Command::SelectNotifications { .. } => "select_notifications",
        Command::SelectPayments { .. } => "select_payments",
    }
}
