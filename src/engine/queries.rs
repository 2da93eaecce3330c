use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::util::average_rating;

use super::conflict::has_conflict;
use super::{Engine, EngineError};

fn check_window(window: Option<&Span>) -> Result<(), EngineError> {
    match window {
        Some(w) if w.duration_ms() > MAX_QUERY_WINDOW_MS => {
            Err(EngineError::LimitExceeded("query window too wide"))
        }
        _ => Ok(()),
    }
}

fn within(window: Option<&Span>, a: &Appointment) -> bool {
    window.is_none_or(|w| w.contains_span(&a.interval().span()))
}

impl Engine {
    pub async fn get_appointment(&self, id: Ulid) -> Option<Appointment> {
        let resource_id = self.resource_for_appointment(&id)?;
        let rs = self.get_resource(&resource_id)?;
        let guard = rs.read().await;
        guard.get_appointment(id).cloned()
    }

    pub async fn find_by_confirmation(&self, confirmation: &str) -> Option<Appointment> {
        let id = self.confirmations.get(confirmation).map(|e| *e.value())?;
        self.get_appointment(id).await
    }

    /// Every appointment a client has booked, across all businesses, by start.
    pub async fn client_appointments(&self, client_id: Ulid) -> Vec<Appointment> {
        let mut out = Vec::new();
        for rs in self.resource_handles() {
            let guard = rs.read().await;
            out.extend(
                guard
                    .appointments
                    .iter()
                    .filter(|a| a.client_id == client_id)
                    .cloned(),
            );
        }
        out.sort_by_key(|a| (a.start, a.id));
        out
    }

    /// Appointments of a business, on its own calendar and on every staff
    /// member's, that fall entirely inside `window` when one is given.
    pub async fn business_appointments(
        &self,
        business_id: Ulid,
        window: Option<Span>,
    ) -> Result<Vec<Appointment>, EngineError> {
        check_window(window.as_ref())?;
        let mut calendars = vec![business_id];
        if let Some(staff) = self.staff_by_business.get(&business_id) {
            calendars.extend(staff.iter().copied());
        }

        let mut out = Vec::new();
        for id in calendars {
            let Some(rs) = self.get_resource(&id) else {
                continue;
            };
            let guard = rs.read().await;
            if guard.business_id() != business_id {
                return Err(EngineError::InvalidInput(format!(
                    "{business_id} is not a business"
                )));
            }
            out.extend(
                guard
                    .appointments
                    .iter()
                    .filter(|a| within(window.as_ref(), a))
                    .cloned(),
            );
        }
        out.sort_by_key(|a| (a.start, a.id));
        Ok(out)
    }

    pub async fn staff_schedule(
        &self,
        staff_id: Ulid,
        window: Option<Span>,
    ) -> Result<Vec<Appointment>, EngineError> {
        check_window(window.as_ref())?;
        let rs = self
            .get_resource(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        let guard = rs.read().await;
        if !guard.is_staff() {
            return Err(EngineError::InvalidInput(format!(
                "{staff_id} is not a staff member"
            )));
        }
        Ok(guard
            .appointments
            .iter()
            .filter(|a| within(window.as_ref(), a))
            .cloned()
            .collect())
    }

    /// Active services of a business, sorted by name.
    pub fn business_services(&self, business_id: Ulid) -> Vec<Service> {
        let mut out: Vec<Service> = self
            .services
            .iter()
            .filter(|s| s.business_id == business_id && s.active)
            .map(|s| s.value().clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    pub fn rating_summary(&self, business_id: Ulid) -> RatingSummary {
        let ratings: Vec<u8> = self
            .feedback
            .iter()
            .filter(|f| f.business_id == business_id)
            .map(|f| f.rating)
            .collect();
        RatingSummary {
            business_id,
            average: average_rating(&ratings),
            count: ratings.len(),
        }
    }

    /// A user's notifications, newest first.
    pub fn user_notifications(&self, user_id: Ulid) -> Vec<Notification> {
        let mut out: Vec<Notification> = self
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .map(|n| n.value().clone())
            .collect();
        out.sort_by(|a, b| b.sent_at.cmp(&a.sent_at).then(b.id.cmp(&a.id)));
        out
    }

    pub fn payment(&self, id: Ulid) -> Option<PaymentRecord> {
        self.payments.get(&id).map(|p| p.value().clone())
    }

    /// Every payment taken against an appointment, newest first.
    pub fn appointment_payments(&self, appointment_id: Ulid) -> Vec<PaymentRecord> {
        let mut out: Vec<PaymentRecord> = self
            .payments
            .iter()
            .filter(|p| p.appointment_id == appointment_id)
            .map(|p| p.value().clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out
    }

    pub fn appointment_payment(&self, appointment_id: Ulid) -> Option<PaymentRecord> {
        self.appointment_payments(appointment_id).into_iter().next()
    }

    /// Dry run: would `[start, start + duration)` collide on this calendar?
    pub async fn check_conflict(
        &self,
        resource_id: Ulid,
        start: Ms,
        duration_minutes: i64,
    ) -> Result<bool, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let existing = rs.read().await.active_intervals(None);
        has_conflict(&existing, start, duration_minutes)
    }
}
