/// Upper bound on repair bays a single garage may own.
pub const MAX_BAYS_PER_GARAGE: u32 = 200;

pub const MAX_GARAGES: usize = 100_000;

pub const MAX_RESERVATIONS_PER_GARAGE: usize = 500_000;

/// Garage and bay display names.
pub const MAX_NAME_LEN: usize = 256;

pub const MAX_COMMENT_LEN: usize = 2_000;

/// A reservation may request at most this many service types.
pub const MAX_SERVICES_PER_RESERVATION: usize = 5;

/// Notifications retained per user in the in-app inbox.
pub const MAX_INBOX_PER_USER: usize = 100;
