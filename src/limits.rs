use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_RESOURCES_PER_TENANT: usize = 50_000;
pub const MAX_STAFF_PER_BUSINESS: usize = 500;
pub const MAX_SERVICES_PER_BUSINESS: usize = 1_000;
pub const MAX_APPOINTMENTS_PER_RESOURCE: usize = 100_000;

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_TEXT_LEN: usize = 4_096;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single appointment may not run longer than a day.
pub const MAX_DURATION_MINUTES: i64 = 24 * 60;

pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;
