mod allocator;
mod availability;
mod error;
mod queries;
mod registry;
mod reservations;

pub use allocator::{pick_free_bay, CAPACITY_REACHED_REASON};
pub use availability::free_bays;
pub use registry::CAPACITY_REDUCED_REASON;
pub use error::EngineError;
pub use reservations::NewReservation;

use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{NotificationDispatch, ReservationNotice, UserEvent};
use crate::observability;
use crate::wal::Wal;

pub type SharedGarageState = Arc<RwLock<GarageState>>;

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

/// Owns the WAL. Each wakeup drains every append already queued and commits
/// them with a single fsync; non-append commands flush the open batch first.
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
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
    debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so stray buffered bytes do not leak
    // into the next batch.
    let flushed = wal.flush_sync();
    let result = result.and(flushed);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
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
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    garages: DashMap<Ulid, SharedGarageState>,
    wal_tx: mpsc::Sender<WalCommand>,
    dispatch: Arc<dyn NotificationDispatch>,
    /// Reverse lookup: bay or reservation id → garage id.
    entity_to_garage: DashMap<Ulid, Ulid>,
    /// Mutations hold it shared; compaction holds it exclusively so the
    /// snapshot and the log swap see no interleaved appends.
    gate: Arc<RwLock<()>>,
    /// Serializes garage creation so duplicate ids are caught.
    creation: Mutex<()>,
    /// Events touching these ids fail to persist.
    #[cfg(test)]
    wal_faults: DashMap<Ulid, ()>,
}

/// Exclusive access to one garage for a read-check-write sequence.
pub(super) struct GarageWrite {
    _gate: OwnedRwLockReadGuard<()>,
    guard: OwnedRwLockWriteGuard<GarageState>,
}

impl Deref for GarageWrite {
    type Target = GarageState;

    fn deref(&self) -> &GarageState {
        &self.guard
    }
}

impl DerefMut for GarageWrite {
    fn deref_mut(&mut self) -> &mut GarageState {
        &mut self.guard
    }
}

/// Apply an event to a garage (caller holds the lock).
fn apply_to_garage(gs: &mut GarageState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BaysCreated { garage_id, bays } => {
            for bay in bays {
                entity_map.insert(bay.id, *garage_id);
            }
            gs.insert_bays(bays.clone());
        }
        Event::BayToggled { bay_id, active, .. } => {
            if let Some(bay) = gs.bay_mut(bay_id) {
                bay.active = *active;
            }
        }
        Event::BaysDeleted { bay_ids, .. } => {
            gs.remove_bays(bay_ids);
            for id in bay_ids {
                entity_map.remove(id);
            }
        }
        Event::ReservationCreated { reservation } => {
            entity_map.insert(reservation.id, reservation.garage_id);
            gs.insert_reservation(reservation.clone());
        }
        Event::ReservationConfirmed { id, bay_id, .. } => {
            if let Some(r) = gs.reservation_mut(id) {
                r.repair_bay_id = Some(*bay_id);
                r.status = ReservationStatus::Confirmed;
            }
        }
        Event::ReservationCancelled { id, reason, .. } => {
            if let Some(r) = gs.reservation_mut(id) {
                r.record_cancellation(reason.as_deref());
            }
        }
        Event::ReservationStatusChanged { id, status, .. } => {
            if let Some(r) = gs.reservation_mut(id) {
                r.status = *status;
            }
        }
        // Garage creation and removal happen at the map level.
        Event::GarageCreated { .. } | Event::GarageDeleted { .. } => {}
    }
}

fn unmap_garage(gs: &GarageState, entity_map: &DashMap<Ulid, Ulid>) {
    for bay in &gs.bays {
        entity_map.remove(&bay.id);
    }
    for r in gs.reservations() {
        entity_map.remove(&r.id);
    }
}

/// Minimal events that recreate a garage's current state.
fn snapshot_events(gs: &GarageState) -> Vec<Event> {
    let mut events = vec![Event::GarageCreated {
        id: gs.id,
        name: gs.name.clone(),
        open_time: gs.open_time,
        close_time: gs.close_time,
    }];
    if !gs.bays.is_empty() {
        events.push(Event::BaysCreated { garage_id: gs.id, bays: gs.bays.clone() });
    }
    events.extend(
        gs.reservations()
            .map(|r| Event::ReservationCreated { reservation: r.clone() }),
    );
    events
}

impl Engine {
    pub fn new(wal_path: PathBuf, dispatch: Arc<dyn NotificationDispatch>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            garages: DashMap::new(),
            wal_tx,
            dispatch,
            entity_to_garage: DashMap::new(),
            gate: Arc::new(RwLock::new(())),
            creation: Mutex::new(()),
            #[cfg(test)]
            wal_faults: DashMap::new(),
        };

        // Replay owns every Arc, so try_write never contends. Blocking lock
        // calls are off limits: this can run inside the runtime.
        for event in &events {
            match event {
                Event::GarageCreated { id, name, open_time, close_time } => {
                    let gs = GarageState::new(*id, name.clone(), *open_time, *close_time);
                    engine.garages.insert(*id, Arc::new(RwLock::new(gs)));
                }
                Event::GarageDeleted { id } => {
                    if let Some((_, gs)) = engine.garages.remove(id)
                        && let Ok(guard) = gs.try_read()
                    {
                        unmap_garage(&guard, &engine.entity_to_garage);
                    }
                }
                other => {
                    let Some(gs) = engine.get_garage(&other.garage_id()) else {
                        warn!("WAL replay: event for unknown garage {}", other.garage_id());
                        continue;
                    };
                    if let Ok(mut guard) = gs.try_write() {
                        apply_to_garage(&mut guard, other, &engine.entity_to_garage);
                    }
                }
            }
        }
        metrics::gauge!(observability::GARAGES_ACTIVE).set(engine.garages.len() as f64);
        debug!("replayed {} WAL events into {} garages", events.len(), engine.garages.len());

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        #[cfg(test)]
        if self.fault_injected(event) {
            return Err(EngineError::WalError("injected write failure".into()));
        }
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_garage(&self, id: &Ulid) -> Option<SharedGarageState> {
        self.garages.get(id).map(|e| e.value().clone())
    }

    pub fn garage_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_garage.get(entity_id).map(|e| *e.value())
    }

    pub fn garage_count(&self) -> usize {
        self.garages.len()
    }

    /// WAL-append then apply. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        gs: &mut GarageState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_garage(gs, event, &self.entity_to_garage);
        Ok(())
    }

    /// Acquire a garage's write lock. Fails if the garage was removed while
    /// we waited for it.
    pub(super) async fn lock_garage(&self, garage_id: Ulid) -> Result<GarageWrite, EngineError> {
        let gate = self.gate.clone().read_owned().await;
        let gs = self
            .get_garage(&garage_id)
            .ok_or(EngineError::GarageNotFound(garage_id))?;
        let guard = gs.clone().write_owned().await;
        let still_mapped = self
            .get_garage(&garage_id)
            .is_some_and(|current| Arc::ptr_eq(&current, &gs));
        if !still_mapped {
            return Err(EngineError::GarageNotFound(garage_id));
        }
        Ok(GarageWrite { _gate: gate, guard })
    }

    /// Resolve a bay or reservation id to its garage and lock it.
    pub(super) async fn lock_entity_garage(
        &self,
        entity_id: Ulid,
        not_found: fn(Ulid) -> EngineError,
    ) -> Result<GarageWrite, EngineError> {
        let garage_id = self.garage_for_entity(&entity_id).ok_or(not_found(entity_id))?;
        self.lock_garage(garage_id).await.map_err(|_| not_found(entity_id))
    }

    pub(super) fn notice_for(gs: &GarageState, r: &Reservation) -> ReservationNotice {
        ReservationNotice {
            user_id: r.user_id,
            reservation_id: r.id,
            garage_name: gs.name.clone(),
            date: r.date,
            window: r.window,
            bay_number: r
                .repair_bay_id
                .and_then(|id| gs.bay(&id))
                .map(|b| b.bay_number),
        }
    }

    /// Deliver notifications in order. Failures are logged and counted, never returned.
    pub(super) async fn dispatch(&self, events: Vec<UserEvent>) {
        for event in events {
            let result = match &event {
                UserEvent::Confirmed(notice) => self.dispatch.notify_confirmed(notice).await,
                UserEvent::Cancelled { notice, reason } => {
                    self.dispatch.notify_cancelled(notice, reason).await
                }
            };
            if let Err(e) = result {
                let notice = event.notice();
                warn!(
                    reservation = %notice.reservation_id,
                    user = %notice.user_id,
                    kind = event.kind(),
                    "{e}"
                );
                metrics::counter!(observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
            }
        }
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.gate.write().await;
        let garages: Vec<SharedGarageState> =
            self.garages.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for gs in garages {
            events.extend(snapshot_events(&*gs.read().await));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        Ok(())
    }

    /// Make every later WAL append that cancels, confirms or changes the
    /// reservation `id`, or adds or removes bays of garage `id`, fail.
    #[cfg(test)]
    pub(super) fn fail_wal_for(&self, id: Ulid) {
        self.wal_faults.insert(id, ());
    }

    #[cfg(test)]
    pub(super) fn clear_wal_faults(&self) {
        self.wal_faults.clear();
    }

    #[cfg(test)]
    fn fault_injected(&self, event: &Event) -> bool {
        let target = match event {
            Event::ReservationConfirmed { id, .. }
            | Event::ReservationCancelled { id, .. }
            | Event::ReservationStatusChanged { id, .. } => *id,
            Event::BaysCreated { garage_id, .. } | Event::BaysDeleted { garage_id, .. } => *garage_id,
            _ => return false,
        };
        self.wal_faults.contains_key(&target)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
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
}
