use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::hours::OperatingHours;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start <= end, "Span start must not be after end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// One appointment's occupancy of a resource: `[start, start + duration)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub start: Ms,
    pub duration_minutes: i64,
}

impl Interval {
    pub fn new(start: Ms, duration_minutes: i64) -> Self {
        Self {
            start,
            duration_minutes,
        }
    }

    pub fn end(&self) -> Ms {
        self.start
            .saturating_add(self.duration_minutes.saturating_mul(MINUTE_MS))
    }

    pub fn span(&self) -> Span {
        Span::new(self.start, self.end().max(self.start))
    }

    /// Point-in-time intervals occupy nothing.
    pub fn is_empty(&self) -> bool {
        self.duration_minutes <= 0
    }

    /// Half-open overlap: touching endpoints are not a conflict, and an
    /// empty interval never conflicts with anything.
    pub fn conflicts_with(&self, other: &Interval) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.start < other.end() && self.end() > other.start
    }
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::NoShow => "no_show",
        }
    }

    /// Whether the appointment still occupies its resource.
    pub fn is_active(&self) -> bool {
        matches!(self, AppointmentStatus::Pending | AppointmentStatus::Confirmed)
    }

    pub fn can_transition_to(&self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, Cancelled)
                | (Confirmed, Completed)
                | (Confirmed, NoShow)
        )
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(AppointmentStatus::Pending),
            "confirmed" => Ok(AppointmentStatus::Confirmed),
            "cancelled" | "canceled" => Ok(AppointmentStatus::Cancelled),
            "completed" => Ok(AppointmentStatus::Completed),
            "no_show" | "noshow" => Ok(AppointmentStatus::NoShow),
            other => Err(format!("unknown appointment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub confirmation: String,
    pub client_id: Ulid,
    pub business_id: Ulid,
    pub service_id: Ulid,
    pub staff_id: Option<Ulid>,
    pub start: Ms,
    pub duration_minutes: i64,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
    pub cancellation_reason: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Appointment {
    /// Calendar this appointment is booked against: the assigned staff
    /// member, or the business when nobody is assigned.
    pub fn resource_id(&self) -> Ulid {
        self.staff_id.unwrap_or(self.business_id)
    }

    pub fn interval(&self) -> Interval {
        Interval::new(self.start, self.duration_minutes)
    }

    pub fn end(&self) -> Ms {
        self.interval().end()
    }
}

// ── Catalogue ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub business_id: Ulid,
    pub name: String,
    pub duration_minutes: i64,
    /// Minor currency units (cents).
    pub price_cents: i64,
    pub category: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: Ulid,
    pub appointment_id: Ulid,
    pub client_id: Ulid,
    pub business_id: Ulid,
    pub rating: u8,
    pub service_quality: Option<u8>,
    pub punctuality: Option<u8>,
    pub cleanliness: Option<u8>,
    pub comments: Option<String>,
    pub created_at: Ms,
}

// ── Notifications ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    BookingConfirmation,
    Reminder,
    Cancellation,
    FollowUp,
    Promotional,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::BookingConfirmation => "booking_confirmation",
            NotificationKind::Reminder => "reminder",
            NotificationKind::Cancellation => "cancellation",
            NotificationKind::FollowUp => "follow_up",
            NotificationKind::Promotional => "promotional",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "booking_confirmation" => Ok(NotificationKind::BookingConfirmation),
            "reminder" => Ok(NotificationKind::Reminder),
            "cancellation" => Ok(NotificationKind::Cancellation),
            "follow_up" => Ok(NotificationKind::FollowUp),
            "promotional" => Ok(NotificationKind::Promotional),
            other => Err(format!("unknown notification kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Ulid,
    pub user_id: Ulid,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub appointment_id: Option<Ulid>,
    pub read: bool,
    pub sent_at: Ms,
}

// ── Payments ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    /// A payment that still counts against its appointment.
    pub fn is_open(&self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Completed)
    }

    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Completed) | (Pending, Failed) | (Completed, Refunded)
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(format!("unknown payment status: {other}")),
        }
    }
}

/// Money taken for one appointment. Provider references are opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: Ulid,
    pub appointment_id: Ulid,
    pub client_id: Ulid,
    pub business_id: Ulid,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub payment_method: Option<String>,
    pub provider_reference: Option<String>,
    pub refund_reference: Option<String>,
    pub receipt_url: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

// ── Resources ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    Business { hours: Option<OperatingHours> },
    Staff {
        business_id: Ulid,
        specialization: Option<String>,
        /// Weekly working hours; `None` means available whenever the business is open.
        schedule: Option<OperatingHours>,
    },
}

/// A bookable calendar: a business or one of its staff members.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: String,
    pub kind: ResourceKind,
    /// Every appointment ever booked here, sorted by `start`.
    pub appointments: Vec<Appointment>,
}

impl ResourceState {
    pub fn new(id: Ulid, name: String, kind: ResourceKind) -> Self {
        Self {
            id,
            name,
            kind,
            appointments: Vec::new(),
        }
    }

    pub fn business_id(&self) -> Ulid {
        match &self.kind {
            ResourceKind::Business { .. } => self.id,
            ResourceKind::Staff { business_id, .. } => *business_id,
        }
    }

    pub fn is_staff(&self) -> bool {
        matches!(self.kind, ResourceKind::Staff { .. })
    }

    /// False when this is a staff calendar whose working hours exclude the interval.
    pub fn available_for(&self, interval: &Interval) -> bool {
        match &self.kind {
            ResourceKind::Staff {
                schedule: Some(schedule),
                ..
            } => schedule.contains(interval),
            _ => true,
        }
    }

    /// Insert maintaining sort order by start.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .binary_search_by_key(&appointment.start, |a| a.start)
            .unwrap_or_else(|e| e);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn get_appointment(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn get_appointment_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// Appointments whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.start < query.end);
        let query_start = query.start;
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.end() > query_start)
    }

    /// Intervals of the appointments still holding this calendar.
    pub fn active_intervals(&self, exclude: Option<Ulid>) -> Vec<Interval> {
        self.appointments
            .iter()
            .filter(|a| a.status.is_active() && Some(a.id) != exclude)
            .map(Appointment::interval)
            .collect()
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BusinessCreated {
        id: Ulid,
        name: String,
        hours: Option<OperatingHours>,
    },
    BusinessUpdated {
        id: Ulid,
        name: String,
        hours: Option<OperatingHours>,
    },
    StaffAdded {
        id: Ulid,
        business_id: Ulid,
        name: String,
        specialization: Option<String>,
        schedule: Option<OperatingHours>,
    },
    StaffScheduleSet {
        id: Ulid,
        schedule: Option<OperatingHours>,
    },
    ServiceCreated {
        service: Service,
    },
    /// Full replacement of a catalogue entry.
    ServiceUpdated {
        service: Service,
    },
    ServiceDeactivated {
        id: Ulid,
        business_id: Ulid,
    },
    AppointmentBooked {
        appointment: Appointment,
    },
    AppointmentRescheduled {
        id: Ulid,
        from_resource: Ulid,
        to_resource: Ulid,
        staff_id: Option<Ulid>,
        start: Ms,
        at: Ms,
    },
    AppointmentStatusChanged {
        id: Ulid,
        resource_id: Ulid,
        status: AppointmentStatus,
        reason: Option<String>,
        at: Ms,
    },
    FeedbackSubmitted {
        feedback: Feedback,
    },
    NotificationCreated {
        notification: Notification,
    },
    NotificationRead {
        id: Ulid,
    },
    PaymentRecorded {
        payment: PaymentRecord,
    },
    PaymentUpdated {
        id: Ulid,
        status: PaymentStatus,
        refund_reference: Option<String>,
        receipt_url: Option<String>,
        at: Ms,
    },
}

// ── Requests ─────────────────────────────────────────────────────

/// One column of an UPDATE: untouched, set to a value, or set to NULL.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Patch<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T> Patch<T> {
    pub fn apply(self, current: Option<T>) -> Option<T> {
        match self {
            Patch::Keep => current,
            Patch::Set(v) => Some(v),
            Patch::Clear => None,
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, Patch::Keep)
    }
}

/// A client's request for a slot. Duration comes from the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub client_id: Ulid,
    pub business_id: Ulid,
    pub service_id: Ulid,
    pub staff_id: Option<Ulid>,
    pub start: Ms,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackRequest {
    pub id: Ulid,
    pub appointment_id: Ulid,
    pub rating: u8,
    pub service_quality: Option<u8>,
    pub punctuality: Option<u8>,
    pub cleanliness: Option<u8>,
    pub comments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRequest {
    pub id: Ulid,
    pub user_id: Ulid,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub appointment_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BusinessUpdate {
    pub name: Option<String>,
    pub hours: Patch<OperatingHours>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceUpdate {
    pub name: Option<String>,
    pub duration_minutes: Option<i64>,
    pub price_cents: Option<i64>,
    pub category: Patch<String>,
}

/// Amount defaults to the service price, currency to BZD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    pub id: Ulid,
    pub appointment_id: Ulid,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub payment_method: Option<String>,
    pub provider_reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentUpdate {
    pub status: PaymentStatus,
    pub refund_reference: Option<String>,
    pub receipt_url: Option<String>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RatingSummary {
    pub business_id: Ulid,
    pub average: f64,
    pub count: usize,
}
