use ulid::Ulid;

use crate::model::{AppointmentStatus, Ms, PaymentStatus};

#[derive(Debug)]
pub enum EngineError {
    /// Negative appointment duration.
    InvalidDuration(i64),
    /// Start or end outside the representable calendar, or outside the bookable range.
    InvalidTimestamp(Ms),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Candidate overlaps this existing appointment.
    Conflict(Ulid),
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    InvalidPaymentTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },
    OutsideBusinessHours(Ms),
    /// The assigned staff member does not work at this time.
    OutsideStaffSchedule {
        staff_id: Ulid,
        start: Ms,
    },
    Inactive(Ulid),
    InvalidInput(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidDuration(d) => write!(f, "invalid duration: {d} minutes"),
            EngineError::InvalidTimestamp(t) => write!(f, "invalid timestamp: {t}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => write!(f, "conflict with appointment: {id}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "cannot move appointment from {from} to {to}")
            }
            EngineError::InvalidPaymentTransition { from, to } => {
                write!(f, "cannot move payment from {from} to {to}")
            }
            EngineError::OutsideBusinessHours(t) => {
                write!(f, "appointment at {t} is outside business hours")
            }
            EngineError::OutsideStaffSchedule { staff_id, start } => {
                write!(f, "staff member {staff_id} is not working at {start}")
            }
            EngineError::Inactive(id) => write!(f, "inactive: {id}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
