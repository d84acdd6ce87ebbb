use std::collections::HashSet;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

// ── Availability ─────────────────────────────────────────────────

/// Bays from `bays` that are not in `reserved`, in input order.
pub fn free_bays<'a>(
    bays: impl IntoIterator<Item = &'a RepairBay>,
    reserved: &HashSet<Ulid>,
) -> Vec<RepairBay> {
    bays.into_iter()
        .filter(|b| !reserved.contains(&b.id))
        .cloned()
        .collect()
}

/// Bays held on `date` by reservations overlapping `window`. Pending
/// reservations hold nothing.
pub(super) fn reserved_bays(gs: &GarageState, date: NaiveDate, window: Window) -> HashSet<Ulid> {
    gs.overlapping(date, window)
        .filter(|r| r.status.occupies_bay())
        .filter_map(|r| r.repair_bay_id)
        .collect()
}

impl Engine {
    /// Active bays free for the whole of `window` on `date`, by bay number.
    pub async fn find_available(
        &self,
        garage_id: Ulid,
        date: NaiveDate,
        window: Window,
    ) -> Result<Vec<RepairBay>, EngineError> {
        let gs = self
            .get_garage(&garage_id)
            .ok_or(EngineError::GarageNotFound(garage_id))?;
        let guard = gs.read().await;
        let reserved = reserved_bays(&guard, date, window);
        Ok(free_bays(guard.active_bays(), &reserved))
    }
}
