use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::UserEvent;
use crate::observability;

use super::{apply_to_garage, unmap_garage, Engine, EngineError};

/// Comment recorded on reservations cancelled because their bay was removed.
pub const CAPACITY_REDUCED_REASON: &str = "garage capacity reduced";

fn validate_bay_count(count: u32) -> Result<(), EngineError> {
    if count > MAX_BAYS_PER_GARAGE {
        return Err(EngineError::LimitExceeded("too many repair bays"));
    }
    Ok(())
}

fn validate_hours(open: ClockTime, close: ClockTime) -> Result<(), EngineError> {
    if open >= close {
        return Err(EngineError::Validation(format!(
            "opening time {open} must be before closing time {close}"
        )));
    }
    Ok(())
}

/// Bays numbered `from..=to`.
fn numbered_bays(garage_id: Ulid, from: u32, to: u32, open: ClockTime, close: ClockTime) -> Vec<RepairBay> {
    (from..=to)
        .map(|n| RepairBay::new(garage_id, n, open, close))
        .collect()
}

impl Engine {
    /// Register a garage and its initial bays `1..=bays`.
    pub async fn create_garage(
        &self,
        id: Ulid,
        name: String,
        bays: u32,
        open_time: ClockTime,
        close_time: ClockTime,
    ) -> Result<GarageInfo, EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::Validation("garage name must not be empty".into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("garage name too long"));
        }
        validate_hours(open_time, close_time)?;
        validate_bay_count(bays)?;

        let _gate = self.gate.read().await;
        let _creating = self.creation.lock().await;
        if self.garages.len() >= MAX_GARAGES {
            return Err(EngineError::LimitExceeded("too many garages"));
        }
        if self.garages.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::GarageCreated { id, name: name.clone(), open_time, close_time };
        self.wal_append(&event).await?;
        let mut gs = GarageState::new(id, name, open_time, close_time);

        // Not yet visible to other tasks, so the bays can go straight in.
        if bays > 0 {
            let event = Event::BaysCreated {
                garage_id: id,
                bays: numbered_bays(id, 1, bays, open_time, close_time),
            };
            if let Err(e) = self.wal_append(&event).await {
                // Replay must drop the half-created garage as well.
                if let Err(undo) = self.wal_append(&Event::GarageDeleted { id }).await {
                    warn!(garage = %id, "failed garage creation not rolled back in WAL: {undo}");
                }
                return Err(e);
            }
            apply_to_garage(&mut gs, &event, &self.entity_to_garage);
        }
        let info = garage_info(&gs);
        self.garages.insert(id, Arc::new(RwLock::new(gs)));
        metrics::gauge!(observability::GARAGES_ACTIVE).set(self.garages.len() as f64);

        info!(garage = %id, bays, "garage created");
        Ok(info)
    }

    /// Create bays `1..=count` for a garage that has none yet.
    pub async fn create_batch(
        &self,
        garage_id: Ulid,
        count: u32,
        open_time: Option<ClockTime>,
        close_time: Option<ClockTime>,
    ) -> Result<Vec<RepairBay>, EngineError> {
        validate_bay_count(count)?;
        let mut gs = self.lock_garage(garage_id).await?;
        if !gs.bays.is_empty() {
            return Err(EngineError::AlreadyExists(garage_id));
        }
        let open = open_time.unwrap_or(gs.open_time);
        let close = close_time.unwrap_or(gs.close_time);
        validate_hours(open, close)?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let bays = numbered_bays(garage_id, 1, count, open, close);
        let event = Event::BaysCreated { garage_id, bays: bays.clone() };
        self.persist_and_apply(&mut gs, &event).await?;
        Ok(bays)
    }

    /// Rebuild a garage's bays to exactly `1..=new_count`. Bays numbered above
    /// `new_count` are removed with their reservations cancelled, and numbers
    /// missing below it (gaps left by a range deletion) are recreated.
    pub async fn resize(
        &self,
        garage_id: Ulid,
        new_count: u32,
        open_time: Option<ClockTime>,
        close_time: Option<ClockTime>,
    ) -> Result<ResizeOutcome, EngineError> {
        validate_bay_count(new_count)?;
        let mut gs = self.lock_garage(garage_id).await?;
        let missing: Vec<u32> = (1..=new_count).filter(|&n| !gs.has_bay_number(n)).collect();
        let highest = gs.max_bay_number();
        if missing.is_empty() && highest <= new_count {
            return Ok(ResizeOutcome::default());
        }
        let open = open_time.unwrap_or(gs.open_time);
        let close = close_time.unwrap_or(gs.close_time);
        if !missing.is_empty() {
            validate_hours(open, close)?;
        }
        let from = gs.bay_count();

        let (removed, outbound) = if highest > new_count {
            self.delete_range_locked(&mut gs, new_count + 1, highest, CAPACITY_REDUCED_REASON)
                .await
        } else {
            (RangeDeletion::default(), Vec::new())
        };

        // A failed creation leaves the removals in place; retrying converges.
        let mut created = Vec::new();
        let mut result = Ok(());
        if !missing.is_empty() {
            let bays: Vec<RepairBay> = missing
                .iter()
                .map(|&n| RepairBay::new(garage_id, n, open, close))
                .collect();
            let event = Event::BaysCreated { garage_id, bays: bays.clone() };
            match self.persist_and_apply(&mut gs, &event).await {
                Ok(()) => created = bays,
                Err(e) => result = Err(e),
            }
        }
        let to = gs.bay_count();
        drop(gs);

        self.dispatch(outbound).await;
        result?;
        info!(garage = %garage_id, from, to, "garage resized");
        Ok(ResizeOutcome { created, removed })
    }

    /// Remove bays numbered `min..=max`, cancelling every live reservation
    /// assigned to one of them first.
    pub async fn delete_range(
        &self,
        garage_id: Ulid,
        min: u32,
        max: u32,
    ) -> Result<RangeDeletion, EngineError> {
        if min == 0 || min > max {
            return Err(EngineError::Validation(format!("invalid bay range {min}..{max}")));
        }
        let mut gs = self.lock_garage(garage_id).await?;
        let (removed, outbound) = self
            .delete_range_locked(&mut gs, min, max, CAPACITY_REDUCED_REASON)
            .await;
        drop(gs);
        self.dispatch(outbound).await;
        Ok(removed)
    }

    /// Cancellations and the bay deletion are independent: a failed
    /// cancellation is skipped, and a failed deletion keeps the cancellations.
    async fn delete_range_locked(
        &self,
        gs: &mut GarageState,
        min: u32,
        max: u32,
        reason: &str,
    ) -> (RangeDeletion, Vec<UserEvent>) {
        let garage_id = gs.id;
        let bay_ids: Vec<Ulid> = gs
            .bays
            .iter()
            .filter(|b| (min..=max).contains(&b.bay_number))
            .map(|b| b.id)
            .collect();
        if bay_ids.is_empty() {
            return (RangeDeletion::default(), Vec::new());
        }

        // Notices are built while the bays still exist so they carry bay numbers.
        let view: &GarageState = gs;
        let affected: Vec<_> = view
            .reservations()
            .filter(|r| r.status.is_live())
            .filter(|r| r.repair_bay_id.is_some_and(|b| bay_ids.contains(&b)))
            .map(|r| (r.id, Self::notice_for(view, r)))
            .collect();

        let mut outcome = RangeDeletion::default();
        let mut outbound = Vec::with_capacity(affected.len());
        for (id, notice) in affected {
            let event = Event::ReservationCancelled {
                id,
                garage_id,
                reason: Some(reason.to_string()),
            };
            match self.persist_and_apply(gs, &event).await {
                Ok(()) => {
                    metrics::counter!(observability::CASCADE_CANCELLATIONS_TOTAL, "cause" => "capacity_reduced")
                        .increment(1);
                    outcome.cancelled.push(id);
                    outbound.push(UserEvent::Cancelled { notice, reason: reason.to_string() });
                }
                Err(e) => warn!(reservation = %id, garage = %garage_id, "cancellation skipped: {e}"),
            }
        }

        let event = Event::BaysDeleted { garage_id, bay_ids: bay_ids.clone() };
        match self.persist_and_apply(gs, &event).await {
            Ok(()) => outcome.deleted_bays = bay_ids,
            Err(e) => warn!(garage = %garage_id, min, max, "bay deletion failed: {e}"),
        }
        (outcome, outbound)
    }

    /// Flip a bay between active and inactive. Existing assignments are kept.
    pub async fn toggle_active(&self, bay_id: Ulid) -> Result<RepairBay, EngineError> {
        let mut gs = self.lock_entity_garage(bay_id, EngineError::BayNotFound).await?;
        let active = gs.bay(&bay_id).ok_or(EngineError::BayNotFound(bay_id))?.active;
        let event = Event::BayToggled { garage_id: gs.id, bay_id, active: !active };
        self.persist_and_apply(&mut gs, &event).await?;
        gs.bay(&bay_id)
            .cloned()
            .ok_or(EngineError::BayNotFound(bay_id))
    }

    pub async fn count_active(&self, garage_id: Ulid) -> Result<usize, EngineError> {
        let gs = self
            .get_garage(&garage_id)
            .ok_or(EngineError::GarageNotFound(garage_id))?;
        let guard = gs.read().await;
        Ok(guard.count_active())
    }

    /// Remove every bay, cancel what is still live, then drop the garage.
    pub async fn delete_garage(&self, garage_id: Ulid) -> Result<RangeDeletion, EngineError> {
        let mut gs = self.lock_garage(garage_id).await?;
        let highest = gs.max_bay_number();
        let (mut removed, mut outbound) = if highest > 0 {
            self.delete_range_locked(&mut gs, 1, highest, CAPACITY_REDUCED_REASON)
                .await
        } else {
            (RangeDeletion::default(), Vec::new())
        };

        // Pending reservations hold no bay, so the range deletion skipped them.
        let pending: Vec<_> = gs
            .reservations()
            .filter(|r| r.status.is_live())
            .map(|r| (r.id, Self::notice_for(&gs, r)))
            .collect();
        for (id, notice) in pending {
            let event = Event::ReservationCancelled {
                id,
                garage_id,
                reason: Some(CAPACITY_REDUCED_REASON.to_string()),
            };
            match self.persist_and_apply(&mut gs, &event).await {
                Ok(()) => {
                    removed.cancelled.push(id);
                    outbound.push(UserEvent::Cancelled {
                        notice,
                        reason: CAPACITY_REDUCED_REASON.to_string(),
                    });
                }
                Err(e) => warn!(reservation = %id, garage = %garage_id, "cancellation skipped: {e}"),
            }
        }

        let deleted = self.wal_append(&Event::GarageDeleted { id: garage_id }).await;
        if deleted.is_ok() {
            self.garages.remove(&garage_id);
            unmap_garage(&gs, &self.entity_to_garage);
            metrics::gauge!(observability::GARAGES_ACTIVE).set(self.garages.len() as f64);
        }
        drop(gs);

        // Users hear about their cancellations even if the garage itself survives.
        self.dispatch(outbound).await;
        deleted?;
        info!(garage = %garage_id, "garage deleted");
        Ok(removed)
    }
}

pub(super) fn garage_info(gs: &GarageState) -> GarageInfo {
    GarageInfo {
        id: gs.id,
        name: gs.name.clone(),
        open_time: gs.open_time,
        close_time: gs.close_time,
        bay_count: gs.bay_count(),
        active_bays: gs.count_active(),
    }
}
