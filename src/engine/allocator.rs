use std::collections::HashSet;

use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::UserEvent;
use crate::observability;

use super::{Engine, EngineError};

/// Comment recorded on pending reservations cancelled once their slot fills.
pub const CAPACITY_REACHED_REASON: &str = "capacity reached for this time slot";

/// First bay (in bay-number order) that no overlapping reservation uses.
pub fn pick_free_bay<'a>(
    mut active: impl Iterator<Item = &'a RepairBay>,
    used: &HashSet<Ulid>,
) -> Option<&'a RepairBay> {
    active.find(|b| !used.contains(&b.id))
}

fn rejected(reason: &'static str, err: EngineError) -> EngineError {
    metrics::counter!(observability::CONFIRMATIONS_REJECTED_TOTAL, "reason" => reason).increment(1);
    err
}

impl Engine {
    /// Confirm a pending reservation onto a free bay.
    ///
    /// The garage write lock is held from the capacity read through the
    /// cascade, so concurrent confirmations in one garage are serialized and
    /// can never both claim the last bay. When this confirmation fills the
    /// garage for its window, every other pending reservation overlapping
    /// that window is cancelled. Pending reservations at other times of the
    /// day are not touched.
    pub async fn confirm_reservation(&self, id: Ulid) -> Result<Confirmation, EngineError> {
        let mut gs = self
            .lock_entity_garage(id, EngineError::ReservationNotFound)
            .await?;
        let garage_id = gs.id;
        let r = gs.reservation(&id).ok_or(EngineError::ReservationNotFound(id))?;
        match r.status {
            ReservationStatus::Pending => {}
            ReservationStatus::Confirmed => {
                return Err(rejected("already_confirmed", EngineError::AlreadyConfirmed(id)));
            }
            ReservationStatus::Cancelled => {
                return Err(rejected("cancelled", EngineError::AlreadyCancelled(id)));
            }
            other => return Err(rejected("not_pending", EngineError::NotPending(id, other))),
        }
        let (date, window) = (r.date, r.window);

        let total_bays = gs.count_active();
        if total_bays == 0 {
            return Err(rejected("no_active_bays", EngineError::NoActiveBays(garage_id)));
        }

        let overlapping_bays: Vec<Option<Ulid>> = gs
            .overlapping(date, window)
            .filter(|o| o.id != id && o.status.holds_capacity())
            .map(|o| o.repair_bay_id)
            .collect();
        if overlapping_bays.len() >= total_bays {
            return Err(rejected(
                "capacity",
                EngineError::CapacityReached { garage_id, capacity: total_bays },
            ));
        }

        let used: HashSet<Ulid> = overlapping_bays.iter().flatten().copied().collect();
        let Some((bay_id, bay_number)) =
            pick_free_bay(gs.active_bays(), &used).map(|b| (b.id, b.bay_number))
        else {
            error!(
                reservation = %id,
                garage = %garage_id,
                active = total_bays,
                overlapping = overlapping_bays.len(),
                "capacity check passed but every active bay is in use"
            );
            return Err(EngineError::Invariant(format!(
                "no free bay for reservation {id} despite {} of {total_bays} bays in use",
                overlapping_bays.len()
            )));
        };

        let event = Event::ReservationConfirmed { id, garage_id, bay_id };
        self.persist_and_apply(&mut gs, &event).await?;
        metrics::counter!(observability::RESERVATIONS_CONFIRMED_TOTAL).increment(1);
        info!(reservation = %id, garage = %garage_id, bay = bay_number, %date, %window, "reservation confirmed");

        let mut outbound = Vec::new();
        if let Some(r) = gs.reservation(&id) {
            outbound.push(UserEvent::Confirmed(Self::notice_for(&gs, r)));
        }

        let mut cascade_cancelled = Vec::new();
        if overlapping_bays.len() + 1 >= total_bays {
            let victims: Vec<_> = gs
                .overlapping(date, window)
                .filter(|o| o.id != id && o.status == ReservationStatus::Pending)
                .map(|o| (o.id, Self::notice_for(&gs, o)))
                .collect();
            for (victim, notice) in victims {
                let event = Event::ReservationCancelled {
                    id: victim,
                    garage_id,
                    reason: Some(CAPACITY_REACHED_REASON.to_string()),
                };
                match self.persist_and_apply(&mut gs, &event).await {
                    Ok(()) => {
                        metrics::counter!(observability::CASCADE_CANCELLATIONS_TOTAL, "cause" => "capacity_reached")
                            .increment(1);
                        debug!(reservation = %victim, confirmed = %id, "pending reservation cancelled");
                        cascade_cancelled.push(victim);
                        outbound.push(UserEvent::Cancelled {
                            notice,
                            reason: CAPACITY_REACHED_REASON.to_string(),
                        });
                    }
                    Err(e) => warn!(reservation = %victim, confirmed = %id, "cascade cancellation skipped: {e}"),
                }
            }
        }
        drop(gs);

        self.dispatch(outbound).await;
        Ok(Confirmation { reservation_id: id, bay_id, bay_number, cascade_cancelled })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bays(n: u32) -> Vec<RepairBay> {
        let gid = Ulid::new();
        let open = ClockTime::from_hm(8, 0).unwrap();
        let close = ClockTime::from_hm(18, 0).unwrap();
        (1..=n).map(|i| RepairBay::new(gid, i, open, close)).collect()
    }

    #[test]
    fn picks_lowest_unused() {
        let all = bays(3);
        let used: HashSet<Ulid> = [all[0].id].into_iter().collect();
        assert_eq!(pick_free_bay(all.iter(), &used).map(|b| b.bay_number), Some(2));
    }

    #[test]
    fn none_when_all_used() {
        let all = bays(2);
        let used: HashSet<Ulid> = all.iter().map(|b| b.id).collect();
        assert!(pick_free_bay(all.iter(), &used).is_none());
    }

    #[test]
    fn skips_filtered_bays() {
        let mut all = bays(3);
        all[0].active = false;
        let pick = pick_free_bay(all.iter().filter(|b| b.active), &HashSet::new());
        assert_eq!(pick.map(|b| b.bay_number), Some(2));
    }
}
