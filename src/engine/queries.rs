use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::registry::garage_info;
use super::{Engine, EngineError, SharedGarageState};

impl Engine {
    fn garage_or_not_found(&self, garage_id: Ulid) -> Result<SharedGarageState, EngineError> {
        self.get_garage(&garage_id)
            .ok_or(EngineError::GarageNotFound(garage_id))
    }

    /// Every garage, ordered by id.
    pub async fn list_garages(&self) -> Vec<GarageInfo> {
        let garages: Vec<SharedGarageState> =
            self.garages.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(garages.len());
        for gs in garages {
            out.push(garage_info(&*gs.read().await));
        }
        out.sort_by_key(|g| g.id);
        out
    }

    pub async fn garage_info(&self, garage_id: Ulid) -> Result<GarageInfo, EngineError> {
        let gs = self.garage_or_not_found(garage_id)?;
        let guard = gs.read().await;
        Ok(garage_info(&guard))
    }

    /// All bays of a garage, active or not, by bay number.
    pub async fn list_bays(&self, garage_id: Ulid) -> Result<Vec<RepairBay>, EngineError> {
        let gs = self.garage_or_not_found(garage_id)?;
        let guard = gs.read().await;
        Ok(guard.bays.clone())
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let garage_id = self
            .garage_for_entity(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let gs = self
            .get_garage(&garage_id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let guard = gs.read().await;
        guard
            .reservation(&id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))
    }

    /// Reservations of a garage by day then window start, optionally one day only.
    pub async fn list_reservations(
        &self,
        garage_id: Ulid,
        date: Option<NaiveDate>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let gs = self.garage_or_not_found(garage_id)?;
        let guard = gs.read().await;
        let out = match date {
            Some(d) => guard.days.get(&d).cloned().unwrap_or_default(),
            None => guard.reservations().cloned().collect(),
        };
        Ok(out)
    }
}
