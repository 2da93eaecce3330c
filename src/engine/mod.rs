mod conflict;
mod error;
mod mutations;
mod queries;

pub use conflict::{has_conflict, validate_candidate};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock, RwLockReadGuard};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is already queued,
/// then pay for a single fsync and answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so a half-written batch never
    // leaks into the next one.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = wal
                .write_snapshot(&events)
                .and_then(|()| wal.install_snapshot());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Per-tenant booking state. Every business and staff member is a
/// resource with its own lock; appointments live on their resource.
pub struct Engine {
    pub(super) resources: DashMap<Ulid, SharedResourceState>,
    /// Business → staff members.
    pub(super) staff_by_business: DashMap<Ulid, Vec<Ulid>>,
    /// Appointment → resource currently holding it.
    pub(super) appointment_index: DashMap<Ulid, Ulid>,
    pub(super) confirmations: DashMap<String, Ulid>,
    pub(super) services: DashMap<Ulid, Service>,
    /// Keyed by appointment id: at most one feedback per appointment.
    pub(super) feedback: DashMap<Ulid, Feedback>,
    pub(super) notifications: DashMap<Ulid, Notification>,
    pub(super) payments: DashMap<Ulid, PaymentRecord>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Writers share it from WAL append through apply; compaction takes it
    /// exclusively so no append lands between its snapshot and the file swap.
    compaction_gate: RwLock<()>,
    /// Serialises catalogue writes so per-business counts and partial
    /// updates see each other.
    pub(super) catalogue: Mutex<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            resources: DashMap::new(),
            staff_by_business: DashMap::new(),
            appointment_index: DashMap::new(),
            confirmations: DashMap::new(),
            services: DashMap::new(),
            feedback: DashMap::new(),
            notifications: DashMap::new(),
            payments: DashMap::new(),
            wal_tx,
            compaction_gate: RwLock::new(()),
            catalogue: Mutex::new(()),
        };

        // We are the sole owner of every lock during replay, so try_write
        // always succeeds. Never block here: this can run inside an async
        // context (lazy tenant creation).
        for event in &events {
            engine.replay_event(event);
        }
        tracing::info!(
            "replayed {} events from {}: {} resources, {} appointments",
            events.len(),
            wal_path.display(),
            engine.resources.len(),
            engine.appointment_index.len()
        );

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::BusinessCreated { .. } | Event::StaffAdded { .. } => {
                self.apply_resource_created(event);
            }
            Event::BusinessUpdated { id, .. } | Event::StaffScheduleSet { id, .. } => {
                self.replay_on(*id, event);
            }
            Event::AppointmentBooked { appointment } => {
                self.replay_on(appointment.resource_id(), event);
            }
            Event::AppointmentStatusChanged { resource_id, .. } => {
                self.replay_on(*resource_id, event);
            }
            Event::AppointmentRescheduled {
                from_resource,
                to_resource,
                ..
            } => {
                let Some(from) = self.get_resource(from_resource) else {
                    return;
                };
                let mut from_guard = from.try_write().expect("replay: uncontended write");
                if from_resource == to_resource {
                    self.apply_move(&mut from_guard, None, event);
                } else if let Some(to) = self.get_resource(to_resource) {
                    let mut to_guard = to.try_write().expect("replay: uncontended write");
                    self.apply_move(&mut from_guard, Some(&mut *to_guard), event);
                }
            }
            other => self.apply_record(other),
        }
    }

    fn replay_on(&self, resource_id: Ulid, event: &Event) {
        if let Some(rs) = self.get_resource(&resource_id) {
            let mut guard = rs.try_write().expect("replay: uncontended write");
            self.apply_to_resource(&mut guard, event);
        }
    }

    /// Register a new business or staff calendar.
    pub(super) fn apply_resource_created(&self, event: &Event) {
        match event {
            Event::BusinessCreated { id, name, hours } => {
                let rs = ResourceState::new(
                    *id,
                    name.clone(),
                    ResourceKind::Business {
                        hours: hours.clone(),
                    },
                );
                self.resources.insert(*id, Arc::new(RwLock::new(rs)));
            }
            Event::StaffAdded {
                id,
                business_id,
                name,
                specialization,
                schedule,
            } => {
                let rs = ResourceState::new(
                    *id,
                    name.clone(),
                    ResourceKind::Staff {
                        business_id: *business_id,
                        specialization: specialization.clone(),
                        schedule: schedule.clone(),
                    },
                );
                self.resources.insert(*id, Arc::new(RwLock::new(rs)));
                self.staff_by_business.entry(*business_id).or_default().push(*id);
            }
            _ => {}
        }
    }

    /// Apply a calendar event to its resource (caller holds the lock).
    pub(super) fn apply_to_resource(&self, rs: &mut ResourceState, event: &Event) {
        match event {
            Event::BusinessUpdated { name, hours, .. } => {
                rs.name = name.clone();
                if let ResourceKind::Business { hours: current } = &mut rs.kind {
                    *current = hours.clone();
                }
            }
            Event::StaffScheduleSet { schedule, .. } => {
                if let ResourceKind::Staff { schedule: current, .. } = &mut rs.kind {
                    *current = schedule.clone();
                }
            }
            Event::AppointmentBooked { appointment } => {
                self.appointment_index.insert(appointment.id, rs.id);
                self.confirmations
                    .insert(appointment.confirmation.clone(), appointment.id);
                rs.insert_appointment(appointment.clone());
            }
            Event::AppointmentStatusChanged {
                id,
                status,
                reason,
                at,
                ..
            } => {
                if let Some(a) = rs.get_appointment_mut(*id) {
                    a.status = *status;
                    if *status == AppointmentStatus::Cancelled {
                        a.cancellation_reason = reason.clone();
                    }
                    a.updated_at = *at;
                }
            }
            Event::AppointmentRescheduled { .. } => self.apply_move(rs, None, event),
            _ => {}
        }
    }

    /// Move an appointment in time and, when `to` is given, onto another calendar.
    pub(super) fn apply_move(
        &self,
        from: &mut ResourceState,
        to: Option<&mut ResourceState>,
        event: &Event,
    ) {
        let Event::AppointmentRescheduled {
            id,
            to_resource,
            staff_id,
            start,
            at,
            ..
        } = event
        else {
            return;
        };
        let Some(mut appointment) = from.remove_appointment(*id) else {
            return;
        };
        appointment.start = *start;
        appointment.staff_id = *staff_id;
        appointment.updated_at = *at;
        self.appointment_index.insert(*id, *to_resource);
        match to {
            Some(to) => to.insert_appointment(appointment),
            None => from.insert_appointment(appointment),
        }
    }

    /// Apply events that live outside any calendar.
    pub(super) fn apply_record(&self, event: &Event) {
        match event {
            Event::ServiceCreated { service } | Event::ServiceUpdated { service } => {
                self.services.insert(service.id, service.clone());
            }
            Event::ServiceDeactivated { id, .. } => {
                if let Some(mut s) = self.services.get_mut(id) {
                    s.active = false;
                }
            }
            Event::FeedbackSubmitted { feedback } => {
                self.feedback.insert(feedback.appointment_id, feedback.clone());
            }
            Event::NotificationCreated { notification } => {
                self.notifications.insert(notification.id, notification.clone());
            }
            Event::NotificationRead { id } => {
                if let Some(mut n) = self.notifications.get_mut(id) {
                    n.read = true;
                }
            }
            Event::PaymentRecorded { payment } => {
                self.payments.insert(payment.id, payment.clone());
            }
            Event::PaymentUpdated {
                id,
                status,
                refund_reference,
                receipt_url,
                at,
            } => {
                if let Some(mut p) = self.payments.get_mut(id) {
                    p.status = *status;
                    if refund_reference.is_some() {
                        p.refund_reference = refund_reference.clone();
                    }
                    if receipt_url.is_some() {
                        p.receipt_url = receipt_url.clone();
                    }
                    p.updated_at = *at;
                }
            }
            _ => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn resource_for_appointment(&self, appointment_id: &Ulid) -> Option<Ulid> {
        self.appointment_index.get(appointment_id).map(|e| *e.value())
    }

    /// Held by every mutation before it takes a calendar lock or appends.
    /// Never take it twice in one task: a queued compaction would deadlock.
    pub(super) async fn write_permit(&self) -> RwLockReadGuard<'_, ()> {
        self.compaction_gate.read().await
    }

    /// WAL-append + apply for a calendar event on a locked resource.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_to_resource(rs, event);
        Ok(())
    }

    /// WAL-append + apply for events outside any calendar.
    pub(super) async fn persist_record(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_record(event);
        Ok(())
    }

    /// Lookup appointment → resource, then take that resource's write lock.
    pub(super) async fn resolve_appointment_write(
        &self,
        appointment_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let resource_id = self
            .resource_for_appointment(appointment_id)
            .ok_or(EngineError::NotFound(*appointment_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.write_owned().await;
        Ok((resource_id, guard))
    }

    /// Clone every resource handle so no DashMap shard lock is held across an await.
    pub(super) fn resource_handles(&self) -> Vec<SharedResourceState> {
        self.resources.iter().map(|e| e.value().clone()).collect()
    }
}
