use std::collections::HashSet;

use chrono::NaiveDate;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::UserEvent;

use super::{Engine, EngineError};

const DEFAULT_CANCEL_REASON: &str = "cancelled on request";

/// A booking request as submitted by a user.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReservation {
    pub id: Ulid,
    pub user_id: Ulid,
    pub garage_id: Ulid,
    pub car_id: Ulid,
    pub date: NaiveDate,
    pub window: Window,
    pub services: Vec<ServiceType>,
    pub comment: Option<String>,
    pub total_amount: u64,
}

fn validate_request(req: &NewReservation) -> Result<(), EngineError> {
    if req.services.len() > MAX_SERVICES_PER_RESERVATION {
        return Err(EngineError::LimitExceeded("too many services on reservation"));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = req.services.iter().find(|s| !seen.insert(**s)) {
        return Err(EngineError::Validation(format!("service {dup} listed twice")));
    }
    if let Some(ref c) = req.comment
        && c.len() > MAX_COMMENT_LEN
    {
        return Err(EngineError::LimitExceeded("comment too long"));
    }
    Ok(())
}

impl Engine {
    /// Record a pending reservation. No bay is assigned until confirmation.
    pub async fn create_reservation(&self, req: NewReservation) -> Result<Reservation, EngineError> {
        validate_request(&req)?;
        let mut gs = self.lock_garage(req.garage_id).await?;
        if self.entity_to_garage.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        if gs.reservation_count() >= MAX_RESERVATIONS_PER_GARAGE {
            return Err(EngineError::LimitExceeded("too many reservations in garage"));
        }

        let reservation = Reservation {
            id: req.id,
            user_id: req.user_id,
            garage_id: req.garage_id,
            car_id: req.car_id,
            date: req.date,
            window: req.window,
            services: req.services,
            comment: req.comment,
            status: ReservationStatus::Pending,
            paid: false,
            total_amount: req.total_amount,
            repair_bay_id: None,
        };
        let event = Event::ReservationCreated { reservation: reservation.clone() };
        self.persist_and_apply(&mut gs, &event).await?;
        info!(reservation = %reservation.id, garage = %reservation.garage_id, date = %reservation.date, window = %reservation.window, "reservation requested");
        Ok(reservation)
    }

    /// Explicit cancellation of a live reservation. The user is notified.
    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        if let Some(ref r) = reason
            && r.len() > MAX_COMMENT_LEN
        {
            return Err(EngineError::LimitExceeded("comment too long"));
        }
        let mut gs = self
            .lock_entity_garage(id, EngineError::ReservationNotFound)
            .await?;
        let r = gs.reservation(&id).ok_or(EngineError::ReservationNotFound(id))?;
        if !r.status.is_live() {
            return Err(EngineError::NotCancellable(id, r.status));
        }
        let notice = Self::notice_for(&gs, r);

        let event = Event::ReservationCancelled { id, garage_id: gs.id, reason: reason.clone() };
        self.persist_and_apply(&mut gs, &event).await?;
        let cancelled = gs
            .reservation(&id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))?;
        drop(gs);

        info!(reservation = %id, "reservation cancelled");
        self.dispatch(vec![UserEvent::Cancelled {
            notice,
            reason: reason.unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string()),
        }])
        .await;
        Ok(cancelled)
    }

    /// confirmed → in_progress, when the car enters its bay.
    pub async fn start_service(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.transition(id, ReservationStatus::Confirmed, ReservationStatus::InProgress)
            .await
    }

    /// in_progress → completed.
    pub async fn complete_service(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.transition(id, ReservationStatus::InProgress, ReservationStatus::Completed)
            .await
    }

    async fn transition(
        &self,
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    ) -> Result<Reservation, EngineError> {
        let mut gs = self
            .lock_entity_garage(id, EngineError::ReservationNotFound)
            .await?;
        let current = gs
            .reservation(&id)
            .ok_or(EngineError::ReservationNotFound(id))?
            .status;
        if current != from {
            return Err(EngineError::InvalidTransition { id, from: current, to });
        }
        let event = Event::ReservationStatusChanged { id, garage_id: gs.id, status: to };
        self.persist_and_apply(&mut gs, &event).await?;
        info!(reservation = %id, %from, %to, "reservation status changed");
        gs.reservation(&id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))
    }
}
