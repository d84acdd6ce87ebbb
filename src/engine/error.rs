use ulid::Ulid;

use crate::model::ReservationStatus;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed input rejected before any side effect.
    Validation(String),
    LimitExceeded(&'static str),
    GarageNotFound(Ulid),
    BayNotFound(Ulid),
    ReservationNotFound(Ulid),
    AlreadyExists(Ulid),
    AlreadyConfirmed(Ulid),
    AlreadyCancelled(Ulid),
    NotPending(Ulid, ReservationStatus),
    NotCancellable(Ulid, ReservationStatus),
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    },
    NoActiveBays(Ulid),
    CapacityReached {
        garage_id: Ulid,
        capacity: usize,
    },
    /// Internal consistency failure; never a client retry condition.
    Invariant(String),
    WalError(String),
}

impl EngineError {
    /// SQLSTATE reported on the wire.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => "22023",
            EngineError::GarageNotFound(_)
            | EngineError::BayNotFound(_)
            | EngineError::ReservationNotFound(_) => "P0002",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::AlreadyConfirmed(_)
            | EngineError::AlreadyCancelled(_)
            | EngineError::NotPending(..)
            | EngineError::NotCancellable(..)
            | EngineError::InvalidTransition { .. }
            | EngineError::NoActiveBays(_)
            | EngineError::CapacityReached { .. } => "P0001",
            EngineError::Invariant(_) => "XX000",
            EngineError::WalError(_) => "58030",
        }
    }

    pub fn is_client_error(&self) -> bool {
        !matches!(self, EngineError::Invariant(_) | EngineError::WalError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::GarageNotFound(id) => write!(f, "garage not found: {id}"),
            EngineError::BayNotFound(id) => write!(f, "repair bay not found: {id}"),
            EngineError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::AlreadyConfirmed(id) => write!(f, "reservation {id} is already confirmed"),
            EngineError::AlreadyCancelled(id) => {
                write!(f, "cannot confirm a cancelled reservation: {id}")
            }
            EngineError::NotPending(id, status) => {
                write!(f, "reservation {id} is {status}, only pending reservations can be confirmed")
            }
            EngineError::NotCancellable(id, status) => {
                write!(f, "reservation {id} is {status} and cannot be cancelled")
            }
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "reservation {id} cannot move from {from} to {to}")
            }
            EngineError::NoActiveBays(id) => write!(f, "no active bays in garage {id}"),
            EngineError::CapacityReached { capacity, .. } => {
                write!(f, "garage capacity reached for this period ({capacity} bays)")
            }
            EngineError::Invariant(msg) => write!(f, "internal invariant violated: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
