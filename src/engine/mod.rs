mod availability;
mod conflict;
mod error;
mod grid;
mod mutations;
mod overlap;
mod queries;
mod range;
mod store;
#[cfg(test)]
mod tests;

pub use availability::{compute, free_windows, merge_overlapping, subtract_intervals, view_of, AvailabilityView, SlotState};
pub use conflict::duration_from_hours;
pub(crate) use conflict::validate_date;
pub use error::EngineError;
pub use grid::{generate, slot_grid};
pub use overlap::overlaps;
pub use range::{resolve_range, ResolvedRange};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// Per-engine knobs, carved out of the server configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Longest a write waits for a resource lock before failing with `Busy`.
    pub lock_timeout: Duration,
    pub reject_past_dates: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
            reject_past_dates: true,
        }
    }
}

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

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then does one fsync for the batch and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
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
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so the partial batch does not leak
    // into the next one; every sender of this batch is told it failed.
    let flush_err = wal.flush_sync().err();
    let result = match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    };

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedResourceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: reservation id → resource id (cancelled ones included).
    pub(super) entity_to_resource: DashMap<Ulid, Ulid>,
    /// Shared by appends that hold no resource lock; compaction takes it exclusively.
    pub(super) compaction_gate: RwLock<()>,
    pub config: EngineConfig,
}

/// Apply an event directly to a ResourceState (no locking — caller holds the lock).
fn apply_to_resource(rs: &mut ResourceState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ReservationCreated { reservation } => {
            entity_map.insert(reservation.id, reservation.resource_id);
            match reservation.status {
                ReservationStatus::Active => rs.insert_reservation(reservation.clone()),
                ReservationStatus::Cancelled => {
                    rs.cancelled.insert(reservation.id, reservation.clone());
                }
            }
        }
        Event::ReservationRescheduled {
            id,
            date,
            start,
            duration,
            quoted_price,
            ..
        } => {
            // Remove and re-insert as one step: there is no state in between
            // where the reservation is missing.
            if let Some(mut r) = rs.remove_reservation(*id) {
                r.date = *date;
                r.start = *start;
                r.duration = *duration;
                r.quoted_price = *quoted_price;
                rs.insert_reservation(r);
            }
        }
        Event::ReservationCancelled { id, .. } => {
            rs.cancel_reservation(*id);
        }
        Event::ResourceUpdated {
            name,
            hours,
            step,
            hourly_rate,
            ..
        } => {
            rs.name = name.clone();
            rs.hours = *hours;
            rs.step = *step;
            rs.hourly_rate = *hourly_rate;
        }
        // ResourceCreated/Deleted are handled at the DashMap level, not here
        Event::ResourceCreated { .. } | Event::ResourceDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            entity_to_resource: DashMap::new(),
            compaction_gate: RwLock::new(()),
            config,
        };

        // We are the sole owner of these Arcs during replay, so try_write
        // always succeeds. Never block here: this may run inside an async
        // context (lazy tenant creation).
        for event in &events {
            match event {
                Event::ResourceCreated { id, name, hours, step, hourly_rate } => {
                    let rs = ResourceState::new(*id, name.clone(), *hours, *step, *hourly_rate);
                    engine.state.insert(*id, Arc::new(RwLock::new(rs)));
                }
                Event::ResourceDeleted { id } => {
                    engine.state.remove(id);
                    engine.entity_to_resource.retain(|_, rid| rid != id);
                }
                other => {
                    if let Some(resource_id) = event_resource_id(other)
                        && let Some(entry) = engine.state.get(&resource_id) {
                            let rs_arc = entry.clone();
                            let mut guard = rs_arc.try_write().map_err(|_| {
                                io::Error::other("replay: resource lock contended")
                            })?;
                            apply_to_resource(&mut guard, other, &engine.entity_to_resource);
                        }
                }
            }
        }

        if !events.is_empty() {
            info!(
                "replayed {} events into {} resources from {}",
                events.len(),
                engine.state.len(),
                wal_path.display()
            );
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
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
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_resource.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append, then apply, then notify. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        resource_id: Ulid,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.entity_to_resource);
        self.notify.send(resource_id, event);
        Ok(())
    }

    /// Lookup reservation → resource, then take that resource's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let resource_id = self
            .get_resource_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let guard = self.lock_resource(resource_id).await?;
        Ok((resource_id, guard))
    }
}

/// Extract the resource_id from an event (for non-Create/Delete events).
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationCreated { reservation } => Some(reservation.resource_id),
        Event::ReservationRescheduled { resource_id, .. }
        | Event::ReservationCancelled { resource_id, .. } => Some(*resource_id),
        Event::ResourceUpdated { id, .. } => Some(*id),
        Event::ResourceCreated { .. } | Event::ResourceDeleted { .. } => None,
    }
}
