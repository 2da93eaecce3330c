use std::collections::HashSet;

use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::hours::OperatingHours;
use crate::limits::*;
use crate::model::*;
use crate::util::{confirmation_number, format_timestamp, now_ms};

use super::conflict::{check_no_conflict, validate_candidate};
use super::{Engine, EngineError, WalCommand};

const DEFAULT_CURRENCY: &str = "BZD";

fn check_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidInput(format!("{what} must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn check_text(text: Option<&str>) -> Result<(), EngineError> {
    match text {
        Some(t) if t.len() > MAX_TEXT_LEN => Err(EngineError::LimitExceeded("text too long")),
        _ => Ok(()),
    }
}

fn check_score(score: Option<u8>, what: &str) -> Result<(), EngineError> {
    match score {
        Some(s) if !(1..=5).contains(&s) => Err(EngineError::InvalidInput(format!(
            "{what} must be between 1 and 5, got {s}"
        ))),
        _ => Ok(()),
    }
}

fn check_service(service: &Service) -> Result<(), EngineError> {
    check_name(&service.name, "service name")?;
    check_text(service.category.as_deref())?;
    if service.duration_minutes <= 0 {
        return Err(EngineError::InvalidDuration(service.duration_minutes));
    }
    if service.duration_minutes > MAX_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("service too long"));
    }
    if service.price_cents < 0 {
        return Err(EngineError::InvalidInput("price must not be negative".into()));
    }
    Ok(())
}

/// ISO 4217 style: three ASCII letters, stored upper-case.
fn currency_code(code: &str) -> Result<String, EngineError> {
    let code = code.trim();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(EngineError::InvalidInput(format!("bad currency code: {code:?}")));
    }
    Ok(code.to_ascii_uppercase())
}

fn conflict_counted(result: Result<(), EngineError>) -> Result<(), EngineError> {
    if let Err(EngineError::Conflict(id)) = &result {
        metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
        tracing::debug!("slot taken by appointment {id}");
    }
    result
}

fn check_schedule(rs: &ResourceState, candidate: &Interval) -> Result<(), EngineError> {
    if rs.available_for(candidate) {
        return Ok(());
    }
    Err(EngineError::OutsideStaffSchedule {
        staff_id: rs.id,
        start: candidate.start,
    })
}

fn changed_concurrently(id: Ulid) -> EngineError {
    EngineError::InvalidInput(format!("appointment {id} changed concurrently, retry"))
}

impl Engine {
    pub async fn create_business(
        &self,
        id: Ulid,
        name: String,
        hours: Option<OperatingHours>,
    ) -> Result<(), EngineError> {
        check_name(&name, "business name")?;
        if self.resources.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many businesses and staff"));
        }
        if self.resources.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::BusinessCreated { id, name, hours };
        let _permit = self.write_permit().await;
        self.wal_append(&event).await?;
        self.apply_resource_created(&event);
        Ok(())
    }

    /// Rename a business or replace its opening hours. Existing bookings
    /// are left where they are.
    pub async fn update_business(&self, id: Ulid, update: BusinessUpdate) -> Result<(), EngineError> {
        if let Some(name) = &update.name {
            check_name(name, "business name")?;
        }
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;

        let _permit = self.write_permit().await;
        let mut guard = rs.write().await;
        let ResourceKind::Business { hours } = &guard.kind else {
            return Err(EngineError::InvalidInput(format!(
                "{id} is a staff member, not a business"
            )));
        };
        let event = Event::BusinessUpdated {
            id,
            hours: update.hours.apply(hours.clone()),
            name: update.name.unwrap_or_else(|| guard.name.clone()),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!("updated business {id}");
        Ok(())
    }

    pub async fn add_staff(
        &self,
        id: Ulid,
        business_id: Ulid,
        name: String,
        specialization: Option<String>,
        schedule: Option<OperatingHours>,
    ) -> Result<(), EngineError> {
        check_name(&name, "staff name")?;
        check_text(specialization.as_deref())?;
        self.business_hours(business_id).await?;
        if self.resources.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many businesses and staff"));
        }
        if self
            .staff_by_business
            .get(&business_id)
            .is_some_and(|s| s.len() >= MAX_STAFF_PER_BUSINESS)
        {
            return Err(EngineError::LimitExceeded("too many staff members"));
        }
        if self.resources.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::StaffAdded {
            id,
            business_id,
            name,
            specialization,
            schedule,
        };
        let _permit = self.write_permit().await;
        self.wal_append(&event).await?;
        self.apply_resource_created(&event);
        Ok(())
    }

    /// Replace a staff member's weekly working hours; `None` clears them.
    pub async fn set_staff_schedule(
        &self,
        staff_id: Ulid,
        schedule: Option<OperatingHours>,
    ) -> Result<(), EngineError> {
        let rs = self
            .get_resource(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;

        let _permit = self.write_permit().await;
        let mut guard = rs.write().await;
        if !guard.is_staff() {
            return Err(EngineError::InvalidInput(format!(
                "{staff_id} is not a staff member"
            )));
        }
        let event = Event::StaffScheduleSet {
            id: staff_id,
            schedule,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!("updated working hours of {staff_id}");
        Ok(())
    }

    pub async fn create_service(&self, mut service: Service) -> Result<(), EngineError> {
        check_service(&service)?;
        self.business_hours(service.business_id).await?;

        let _permit = self.write_permit().await;
        let _catalogue = self.catalogue.lock().await;
        if self.services.contains_key(&service.id) {
            return Err(EngineError::AlreadyExists(service.id));
        }
        let offered = self
            .services
            .iter()
            .filter(|s| s.business_id == service.business_id)
            .count();
        if offered >= MAX_SERVICES_PER_BUSINESS {
            return Err(EngineError::LimitExceeded("too many services"));
        }

        service.active = true;
        self.persist_record(&Event::ServiceCreated { service }).await
    }

    /// Edit name, duration, price or category. Appointments already booked
    /// keep the duration they were booked with.
    pub async fn update_service(&self, id: Ulid, update: ServiceUpdate) -> Result<Service, EngineError> {
        let _permit = self.write_permit().await;
        let _catalogue = self.catalogue.lock().await;
        let mut service = self
            .services
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        if let Some(name) = update.name {
            service.name = name;
        }
        if let Some(minutes) = update.duration_minutes {
            service.duration_minutes = minutes;
        }
        if let Some(cents) = update.price_cents {
            service.price_cents = cents;
        }
        service.category = update.category.apply(service.category.take());
        check_service(&service)?;

        self.persist_record(&Event::ServiceUpdated {
            service: service.clone(),
        })
        .await?;
        tracing::info!("updated service {id}");
        Ok(service)
    }

    pub async fn deactivate_service(&self, id: Ulid) -> Result<(), EngineError> {
        let _permit = self.write_permit().await;
        let _catalogue = self.catalogue.lock().await;
        let business_id = self
            .services
            .get(&id)
            .map(|s| s.business_id)
            .ok_or(EngineError::NotFound(id))?;
        self.persist_record(&Event::ServiceDeactivated { id, business_id })
            .await
    }

    /// Validate, conflict-check and persist a booking under the calendar's
    /// write lock, so two clients can never both win the same slot.
    pub async fn book_appointment(&self, req: BookingRequest) -> Result<Appointment, EngineError> {
        let service = self
            .services
            .get(&req.service_id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(req.service_id))?;
        if service.business_id != req.business_id {
            return Err(EngineError::InvalidInput(format!(
                "service {} is not offered by business {}",
                service.id, req.business_id
            )));
        }
        if !service.active {
            return Err(EngineError::Inactive(service.id));
        }
        check_text(req.notes.as_deref())?;
        let candidate = validate_candidate(req.start, service.duration_minutes)?;
        if self.appointment_index.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let hours = self.business_hours(req.business_id).await?;
        if let Some(staff_id) = req.staff_id {
            self.check_staff_of(staff_id, req.business_id).await?;
        }
        if hours.as_ref().is_some_and(|h| !h.contains(&candidate)) {
            return Err(EngineError::OutsideBusinessHours(req.start));
        }

        let resource_id = req.staff_id.unwrap_or(req.business_id);
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let permit = self.write_permit().await;
        let mut guard = rs.write().await;
        check_schedule(&guard, &candidate)?;
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many appointments on calendar"));
        }
        conflict_counted(check_no_conflict(&guard, &candidate, None))?;

        let now = now_ms();
        let appointment = Appointment {
            id: req.id,
            confirmation: confirmation_number(now),
            client_id: req.client_id,
            business_id: req.business_id,
            service_id: service.id,
            staff_id: req.staff_id,
            start: req.start,
            duration_minutes: service.duration_minutes,
            status: AppointmentStatus::Pending,
            notes: req.notes,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        };
        let event = Event::AppointmentBooked {
            appointment: appointment.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);
        drop(permit);

        metrics::counter!(crate::observability::BOOKINGS_TOTAL).increment(1);
        tracing::info!(
            "booked {} ({}) for {} on {}",
            appointment.id,
            appointment.confirmation,
            format_timestamp(appointment.start),
            resource_id
        );
        self.notify_client(
            &appointment,
            NotificationKind::BookingConfirmation,
            "Booking confirmed",
            format!(
                "Your {} appointment {} is booked for {}.",
                service.name,
                appointment.confirmation,
                format_timestamp(appointment.start)
            ),
        )
        .await;
        Ok(appointment)
    }

    /// Move an appointment to a new start time and, through `staff`, onto
    /// another staff member of the same business or back to the business
    /// calendar. The appointment's own slot never counts against it.
    pub async fn reschedule_appointment(
        &self,
        id: Ulid,
        new_start: Ms,
        staff: Patch<Ulid>,
    ) -> Result<Appointment, EngineError> {
        let current = self
            .get_appointment(id)
            .await
            .ok_or(EngineError::NotFound(id))?;
        if !current.status.is_active() {
            return Err(EngineError::InvalidInput(format!(
                "cannot reschedule a {} appointment",
                current.status
            )));
        }
        let candidate = validate_candidate(new_start, current.duration_minutes)?;
        let hours = self.business_hours(current.business_id).await?;
        if let Patch::Set(staff_id) = staff {
            self.check_staff_of(staff_id, current.business_id).await?;
        }
        if hours.as_ref().is_some_and(|h| !h.contains(&candidate)) {
            return Err(EngineError::OutsideBusinessHours(new_start));
        }

        let staff_id = staff.apply(current.staff_id);
        let from_id = current.resource_id();
        let to_id = staff_id.unwrap_or(current.business_id);
        let event = Event::AppointmentRescheduled {
            id,
            from_resource: from_id,
            to_resource: to_id,
            staff_id,
            start: new_start,
            at: now_ms(),
        };

        let from_rs = self
            .get_resource(&from_id)
            .ok_or(EngineError::NotFound(from_id))?;
        let _permit = self.write_permit().await;
        if from_id == to_id {
            let mut guard = from_rs.write().await;
            ensure_unchanged(&guard, &current)?;
            check_schedule(&guard, &candidate)?;
            conflict_counted(check_no_conflict(&guard, &candidate, Some(id)))?;
            self.persist_and_apply(&mut guard, &event).await?;
        } else {
            let to_rs = self
                .get_resource(&to_id)
                .ok_or(EngineError::NotFound(to_id))?;
            // Lock in id order so opposite moves cannot deadlock.
            let (mut from_guard, mut to_guard) = if from_id < to_id {
                let f = from_rs.write_owned().await;
                let t = to_rs.write_owned().await;
                (f, t)
            } else {
                let t = to_rs.write_owned().await;
                let f = from_rs.write_owned().await;
                (f, t)
            };
            ensure_unchanged(&from_guard, &current)?;
            check_schedule(&to_guard, &candidate)?;
            if to_guard.appointments.len() >= MAX_APPOINTMENTS_PER_RESOURCE {
                return Err(EngineError::LimitExceeded("too many appointments on calendar"));
            }
            conflict_counted(check_no_conflict(&to_guard, &candidate, None))?;
            self.wal_append(&event).await?;
            self.apply_move(&mut from_guard, Some(&mut *to_guard), &event);
        }

        tracing::info!("rescheduled {id} to {} on {to_id}", format_timestamp(new_start));
        self.get_appointment(id)
            .await
            .ok_or(EngineError::NotFound(id))
    }

    /// Advance an appointment through pending → confirmed → completed/no-show,
    /// or cancel it while it is still pending or confirmed.
    pub async fn set_status(
        &self,
        id: Ulid,
        status: AppointmentStatus,
        reason: Option<String>,
    ) -> Result<Appointment, EngineError> {
        check_text(reason.as_deref())?;
        let permit = self.write_permit().await;
        let (resource_id, mut guard) = self.resolve_appointment_write(&id).await?;
        let from = guard
            .get_appointment(id)
            .map(|a| a.status)
            .ok_or_else(|| changed_concurrently(id))?;
        if !from.can_transition_to(status) {
            return Err(EngineError::InvalidTransition { from, to: status });
        }

        let event = Event::AppointmentStatusChanged {
            id,
            resource_id,
            status,
            reason,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let updated = guard
            .get_appointment(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        drop(guard);
        drop(permit);

        tracing::info!("appointment {id}: {from} -> {status}");
        match status {
            AppointmentStatus::Cancelled => {
                self.notify_client(
                    &updated,
                    NotificationKind::Cancellation,
                    "Appointment cancelled",
                    format!(
                        "Your appointment {} on {} has been cancelled.",
                        updated.confirmation,
                        format_timestamp(updated.start)
                    ),
                )
                .await;
            }
            AppointmentStatus::Completed => {
                self.notify_client(
                    &updated,
                    NotificationKind::FollowUp,
                    "How was your visit?",
                    format!(
                        "Thanks for visiting! Rate appointment {} to help us improve.",
                        updated.confirmation
                    ),
                )
                .await;
            }
            _ => {}
        }
        Ok(updated)
    }

    pub async fn cancel_appointment(
        &self,
        id: Ulid,
        reason: Option<String>,
    ) -> Result<Appointment, EngineError> {
        self.set_status(id, AppointmentStatus::Cancelled, reason).await
    }

    pub async fn submit_feedback(&self, req: FeedbackRequest) -> Result<Feedback, EngineError> {
        check_score(Some(req.rating), "rating")?;
        check_score(req.service_quality, "service quality")?;
        check_score(req.punctuality, "punctuality")?;
        check_score(req.cleanliness, "cleanliness")?;
        check_text(req.comments.as_deref())?;

        let _permit = self.write_permit().await;
        let (_, calendar) = self.resolve_appointment_write(&req.appointment_id).await?;
        let appointment = calendar
            .get_appointment(req.appointment_id)
            .cloned()
            .ok_or_else(|| changed_concurrently(req.appointment_id))?;
        if appointment.status != AppointmentStatus::Completed {
            return Err(EngineError::InvalidInput(format!(
                "feedback needs a completed appointment, {} is {}",
                appointment.id, appointment.status
            )));
        }
        if self.feedback.contains_key(&req.appointment_id) {
            return Err(EngineError::AlreadyExists(req.appointment_id));
        }

        let feedback = Feedback {
            id: req.id,
            appointment_id: appointment.id,
            client_id: appointment.client_id,
            business_id: appointment.business_id,
            rating: req.rating,
            service_quality: req.service_quality,
            punctuality: req.punctuality,
            cleanliness: req.cleanliness,
            comments: req.comments,
            created_at: now_ms(),
        };
        self.persist_record(&Event::FeedbackSubmitted {
            feedback: feedback.clone(),
        })
        .await?;
        Ok(feedback)
    }

    pub async fn create_notification(
        &self,
        req: NotificationRequest,
    ) -> Result<Notification, EngineError> {
        check_name(&req.title, "title")?;
        check_text(Some(&req.message))?;
        if self.notifications.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        let notification = Notification {
            id: req.id,
            user_id: req.user_id,
            kind: req.kind,
            title: req.title,
            message: req.message,
            appointment_id: req.appointment_id,
            read: false,
            sent_at: now_ms(),
        };
        let _permit = self.write_permit().await;
        self.persist_record(&Event::NotificationCreated {
            notification: notification.clone(),
        })
        .await?;
        Ok(notification)
    }

    pub async fn mark_notification_read(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.notifications.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let _permit = self.write_permit().await;
        self.persist_record(&Event::NotificationRead { id }).await
    }

    /// Open a pending payment for an appointment. At most one pending or
    /// completed payment exists per appointment; the appointment's calendar
    /// lock serialises payment changes on it.
    pub async fn record_payment(&self, req: PaymentRequest) -> Result<PaymentRecord, EngineError> {
        check_text(req.payment_method.as_deref())?;
        check_text(req.provider_reference.as_deref())?;
        if let Some(amount) = req.amount_cents.filter(|a| *a < 0) {
            return Err(EngineError::InvalidInput(format!(
                "payment amount must not be negative, got {amount}"
            )));
        }
        let currency = req
            .currency
            .as_deref()
            .map_or_else(|| Ok(DEFAULT_CURRENCY.to_string()), currency_code)?;
        if self.payments.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let _permit = self.write_permit().await;
        let (_calendar, appointment) = self.lock_appointment(req.appointment_id).await?;
        if matches!(
            appointment.status,
            AppointmentStatus::Cancelled | AppointmentStatus::NoShow
        ) {
            return Err(EngineError::InvalidInput(format!(
                "cannot take payment for a {} appointment",
                appointment.status
            )));
        }
        let open = self
            .payments
            .iter()
            .find(|p| p.appointment_id == appointment.id && p.status.is_open())
            .map(|p| p.id);
        if let Some(open) = open {
            return Err(EngineError::AlreadyExists(open));
        }
        let amount_cents = match req.amount_cents {
            Some(amount) => amount,
            None => self
                .services
                .get(&appointment.service_id)
                .map(|s| s.price_cents)
                .ok_or(EngineError::NotFound(appointment.service_id))?,
        };

        let now = now_ms();
        let payment = PaymentRecord {
            id: req.id,
            appointment_id: appointment.id,
            client_id: appointment.client_id,
            business_id: appointment.business_id,
            amount_cents,
            currency,
            status: PaymentStatus::Pending,
            payment_method: req.payment_method,
            provider_reference: req.provider_reference,
            refund_reference: None,
            receipt_url: None,
            created_at: now,
            updated_at: now,
        };
        self.persist_record(&Event::PaymentRecorded {
            payment: payment.clone(),
        })
        .await?;
        tracing::info!(
            "payment {} of {} cents opened for {}",
            payment.id,
            payment.amount_cents,
            payment.appointment_id
        );
        Ok(payment)
    }

    /// Move a payment through pending → completed/failed, completed → refunded.
    pub async fn update_payment(
        &self,
        id: Ulid,
        update: PaymentUpdate,
    ) -> Result<PaymentRecord, EngineError> {
        check_text(update.refund_reference.as_deref())?;
        check_text(update.receipt_url.as_deref())?;
        let appointment_id = self
            .payments
            .get(&id)
            .map(|p| p.appointment_id)
            .ok_or(EngineError::NotFound(id))?;

        let _permit = self.write_permit().await;
        let _calendar = self.lock_appointment(appointment_id).await?;
        let from = self
            .payments
            .get(&id)
            .map(|p| p.status)
            .ok_or(EngineError::NotFound(id))?;
        if !from.can_transition_to(update.status) {
            return Err(EngineError::InvalidPaymentTransition {
                from,
                to: update.status,
            });
        }

        self.persist_record(&Event::PaymentUpdated {
            id,
            status: update.status,
            refund_reference: update.refund_reference,
            receipt_url: update.receipt_url,
            at: now_ms(),
        })
        .await?;
        tracing::info!("payment {id}: {from} -> {}", update.status);
        self.payments
            .get(&id)
            .map(|p| p.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    /// Record a reminder for every active appointment starting within
    /// `lead_ms` of `now` that has not had one yet. Returns how many were sent.
    pub async fn send_due_reminders(&self, now: Ms, lead_ms: Ms) -> usize {
        let reminded: HashSet<Ulid> = self
            .notifications
            .iter()
            .filter(|n| n.kind == NotificationKind::Reminder)
            .filter_map(|n| n.appointment_id)
            .collect();

        let window = Span::new(now, now.saturating_add(lead_ms.max(0)));
        let mut due = Vec::new();
        for rs in self.resource_handles() {
            let guard = rs.read().await;
            due.extend(
                guard
                    .overlapping(&window)
                    .filter(|a| a.status.is_active() && a.start > now)
                    .filter(|a| !reminded.contains(&a.id))
                    .cloned(),
            );
        }

        for appointment in &due {
            self.notify_client(
                appointment,
                NotificationKind::Reminder,
                "Appointment reminder",
                format!(
                    "Reminder: appointment {} starts at {}.",
                    appointment.confirmation,
                    format_timestamp(appointment.start)
                ),
            )
            .await;
        }
        due.len()
    }

    /// Rewrite the WAL with the minimal events that recreate current state.
    /// Writers are held off from the first snapshot read until the new file
    /// is in place.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.compaction_gate.write().await;

        let mut businesses = Vec::new();
        let mut staff = Vec::new();
        let mut appointments = Vec::new();
        let mut seen = HashSet::new();

        for rs in self.resource_handles() {
            let guard = rs.read().await;
            match &guard.kind {
                ResourceKind::Business { hours } => businesses.push(Event::BusinessCreated {
                    id: guard.id,
                    name: guard.name.clone(),
                    hours: hours.clone(),
                }),
                ResourceKind::Staff {
                    business_id,
                    specialization,
                    schedule,
                } => staff.push(Event::StaffAdded {
                    id: guard.id,
                    business_id: *business_id,
                    name: guard.name.clone(),
                    specialization: specialization.clone(),
                    schedule: schedule.clone(),
                }),
            }
            for a in &guard.appointments {
                if seen.insert(a.id) {
                    appointments.push(Event::AppointmentBooked {
                        appointment: a.clone(),
                    });
                }
            }
        }

        // Staff replay needs its business; bookings need their calendar.
        let mut events = businesses;
        events.append(&mut staff);
        events.extend(self.services.iter().map(|s| Event::ServiceCreated {
            service: s.value().clone(),
        }));
        events.append(&mut appointments);
        events.extend(self.feedback.iter().map(|f| Event::FeedbackSubmitted {
            feedback: f.value().clone(),
        }));
        events.extend(self.notifications.iter().map(|n| Event::NotificationCreated {
            notification: n.value().clone(),
        }));
        events.extend(self.payments.iter().map(|p| Event::PaymentRecorded {
            payment: p.value().clone(),
        }));

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    // ── Helpers ──────────────────────────────────────────────────

    /// Opening hours of a business; errors if the id is not a business.
    async fn business_hours(&self, business_id: Ulid) -> Result<Option<OperatingHours>, EngineError> {
        let rs = self
            .get_resource(&business_id)
            .ok_or(EngineError::NotFound(business_id))?;
        let guard = rs.read().await;
        match &guard.kind {
            ResourceKind::Business { hours } => Ok(hours.clone()),
            ResourceKind::Staff { .. } => Err(EngineError::InvalidInput(format!(
                "{business_id} is a staff member, not a business"
            ))),
        }
    }

    async fn check_staff_of(&self, staff_id: Ulid, business_id: Ulid) -> Result<(), EngineError> {
        let rs = self
            .get_resource(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        let guard = rs.read().await;
        match &guard.kind {
            ResourceKind::Staff {
                business_id: employer,
                ..
            } if *employer == business_id => Ok(()),
            _ => Err(EngineError::InvalidInput(format!(
                "{staff_id} is not a staff member of {business_id}"
            ))),
        }
    }

    /// Write-lock the calendar holding an appointment and read it under that lock.
    async fn lock_appointment(
        &self,
        id: Ulid,
    ) -> Result<(OwnedRwLockWriteGuard<ResourceState>, Appointment), EngineError> {
        let (_, guard) = self.resolve_appointment_write(&id).await?;
        let appointment = guard
            .get_appointment(id)
            .cloned()
            .ok_or_else(|| changed_concurrently(id))?;
        Ok((guard, appointment))
    }

    /// Record a client notification for an appointment. Failure is logged,
    /// not returned: the appointment change itself is already durable.
    /// Callers must not hold a write permit.
    async fn notify_client(
        &self,
        appointment: &Appointment,
        kind: NotificationKind,
        title: &str,
        message: String,
    ) {
        let req = NotificationRequest {
            id: Ulid::new(),
            user_id: appointment.client_id,
            kind,
            title: title.to_string(),
            message,
            appointment_id: Some(appointment.id),
        };
        if let Err(e) = self.create_notification(req).await {
            tracing::warn!(
                "could not record {} notification for {}: {e}",
                kind.as_str(),
                appointment.id
            );
        }
    }
}

/// Between the unlocked read and taking the write lock the appointment may
/// have been moved or cancelled by someone else.
fn ensure_unchanged(rs: &ResourceState, seen: &Appointment) -> Result<(), EngineError> {
    match rs.get_appointment(seen.id) {
        Some(a) if a.status.is_active() && a.start == seen.start => Ok(()),
        _ => Err(changed_concurrently(seen.id)),
    }
}
