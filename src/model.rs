use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Local wall-clock time of day, stored as minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClockTime(u16);

impl ClockTime {
    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self(hour * 60 + minute))
    }

    /// Parse strict `HH:MM` (00:00 through 23:59).
    pub fn parse(s: &str) -> Option<Self> {
        let b = s.as_bytes();
        if b.len() != 5 || b[2] != b':' {
            return None;
        }
        let digit = |c: u8| c.is_ascii_digit().then(|| u16::from(c - b'0'));
        let hour = digit(b[0])? * 10 + digit(b[1])?;
        let minute = digit(b[3])? * 10 + digit(b[4])?;
        Self::from_hm(hour, minute)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

/// Half-open time-of-day window `[start, end)` on a single calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: ClockTime,
    pub end: ClockTime,
}

impl Window {
    pub fn new(start: ClockTime, end: ClockTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_minutes(&self) -> u16 {
        self.end.minutes() - self.start.minutes()
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Window) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::InProgress => "in_progress",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(ReservationStatus::Pending),
            "confirmed" => Some(ReservationStatus::Confirmed),
            "in_progress" => Some(ReservationStatus::InProgress),
            "completed" => Some(ReservationStatus::Completed),
            "cancelled" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }

    /// Counts against garage capacity when confirming another reservation.
    pub fn holds_capacity(self) -> bool {
        matches!(self, ReservationStatus::Confirmed | ReservationStatus::InProgress)
    }

    /// Makes its bay unavailable in availability listings.
    pub fn occupies_bay(self) -> bool {
        matches!(
            self,
            ReservationStatus::Confirmed | ReservationStatus::InProgress | ReservationStatus::Completed
        )
    }

    /// Still has a claim on the garage; cancelled by capacity reductions.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ReservationStatus::Pending | ReservationStatus::Confirmed | ReservationStatus::InProgress
        )
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed vocabulary of services a reservation can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceType {
    OilChange,
    TechnicalInspection,
    TireRepair,
    TireChange,
    Brakes,
    Battery,
    AirConditioning,
    Exhaust,
    FullService,
    ElectronicDiagnostics,
    Bodywork,
    Paint,
    Windshield,
    Suspension,
    Clutch,
    Transmission,
    FuelInjection,
    Cooling,
    Starter,
    CarWash,
    WheelBalancing,
    WheelAlignment,
    ElectricalSystem,
    AirFilter,
    OilFilter,
    BrakePads,
}

impl ServiceType {
    pub const ALL: [ServiceType; 26] = [
        ServiceType::OilChange,
        ServiceType::TechnicalInspection,
        ServiceType::TireRepair,
        ServiceType::TireChange,
        ServiceType::Brakes,
        ServiceType::Battery,
        ServiceType::AirConditioning,
        ServiceType::Exhaust,
        ServiceType::FullService,
        ServiceType::ElectronicDiagnostics,
        ServiceType::Bodywork,
        ServiceType::Paint,
        ServiceType::Windshield,
        ServiceType::Suspension,
        ServiceType::Clutch,
        ServiceType::Transmission,
        ServiceType::FuelInjection,
        ServiceType::Cooling,
        ServiceType::Starter,
        ServiceType::CarWash,
        ServiceType::WheelBalancing,
        ServiceType::WheelAlignment,
        ServiceType::ElectricalSystem,
        ServiceType::AirFilter,
        ServiceType::OilFilter,
        ServiceType::BrakePads,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::OilChange => "oil_change",
            ServiceType::TechnicalInspection => "technical_inspection",
            ServiceType::TireRepair => "tire_repair",
            ServiceType::TireChange => "tire_change",
            ServiceType::Brakes => "brakes",
            ServiceType::Battery => "battery",
            ServiceType::AirConditioning => "air_conditioning",
            ServiceType::Exhaust => "exhaust",
            ServiceType::FullService => "full_service",
            ServiceType::ElectronicDiagnostics => "electronic_diagnostics",
            ServiceType::Bodywork => "bodywork",
            ServiceType::Paint => "paint",
            ServiceType::Windshield => "windshield",
            ServiceType::Suspension => "suspension",
            ServiceType::Clutch => "clutch",
            ServiceType::Transmission => "transmission",
            ServiceType::FuelInjection => "fuel_injection",
            ServiceType::Cooling => "cooling",
            ServiceType::Starter => "starter",
            ServiceType::CarWash => "car_wash",
            ServiceType::WheelBalancing => "wheel_balancing",
            ServiceType::WheelAlignment => "wheel_alignment",
            ServiceType::ElectricalSystem => "electrical_system",
            ServiceType::AirFilter => "air_filter",
            ServiceType::OilFilter => "oil_filter",
            ServiceType::BrakePads => "brake_pads",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        Self::ALL.iter().copied().find(|t| t.as_str().eq_ignore_ascii_case(s))
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A physical repair slot; the unit of concurrent capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairBay {
    pub id: Ulid,
    pub garage_id: Ulid,
    /// 1-based, unique within the garage.
    pub bay_number: u32,
    pub name: String,
    pub open_time: ClockTime,
    pub close_time: ClockTime,
    pub active: bool,
}

impl RepairBay {
    pub fn new(garage_id: Ulid, bay_number: u32, open_time: ClockTime, close_time: ClockTime) -> Self {
        Self {
            id: Ulid::new(),
            garage_id,
            bay_number,
            name: format!("Bay {bay_number}"),
            open_time,
            close_time,
            active: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub user_id: Ulid,
    pub garage_id: Ulid,
    pub car_id: Ulid,
    pub date: NaiveDate,
    pub window: Window,
    pub services: Vec<ServiceType>,
    pub comment: Option<String>,
    pub status: ReservationStatus,
    pub paid: bool,
    /// Minor currency units.
    pub total_amount: u64,
    /// Authoritative only while the status occupies a bay.
    pub repair_bay_id: Option<Ulid>,
}

impl Reservation {
    /// Mark cancelled, appending `reason` to any existing comment.
    pub fn record_cancellation(&mut self, reason: Option<&str>) {
        self.status = ReservationStatus::Cancelled;
        if let Some(reason) = reason {
            self.comment = Some(match self.comment.take() {
                Some(existing) if !existing.is_empty() => format!("{existing}\n{reason}"),
                _ => reason.to_string(),
            });
        }
    }
}

/// A garage with its bays and reservations. Guarded by one lock per garage.
#[derive(Debug, Clone)]
pub struct GarageState {
    pub id: Ulid,
    pub name: String,
    /// Default hours applied to bays created without explicit hours.
    pub open_time: ClockTime,
    pub close_time: ClockTime,
    /// Sorted by `bay_number`.
    pub bays: Vec<RepairBay>,
    /// Reservations per calendar day, each day sorted by `window.start`.
    pub days: BTreeMap<NaiveDate, Vec<Reservation>>,
    reservation_days: HashMap<Ulid, NaiveDate>,
}

impl GarageState {
    pub fn new(id: Ulid, name: String, open_time: ClockTime, close_time: ClockTime) -> Self {
        Self {
            id,
            name,
            open_time,
            close_time,
            bays: Vec::new(),
            days: BTreeMap::new(),
            reservation_days: HashMap::new(),
        }
    }

    pub fn bay_count(&self) -> u32 {
        self.bays.len() as u32
    }

    /// Highest bay number. Exceeds `bay_count` when a range deletion left a gap.
    pub fn max_bay_number(&self) -> u32 {
        self.bays.last().map_or(0, |b| b.bay_number)
    }

    pub fn has_bay_number(&self, number: u32) -> bool {
        self.bays.binary_search_by_key(&number, |b| b.bay_number).is_ok()
    }

    pub fn active_bays(&self) -> impl Iterator<Item = &RepairBay> {
        self.bays.iter().filter(|b| b.active)
    }

    pub fn count_active(&self) -> usize {
        self.active_bays().count()
    }

    pub fn bay(&self, id: &Ulid) -> Option<&RepairBay> {
        self.bays.iter().find(|b| b.id == *id)
    }

    pub fn bay_mut(&mut self, id: &Ulid) -> Option<&mut RepairBay> {
        self.bays.iter_mut().find(|b| b.id == *id)
    }

    /// Insert bays keeping `bay_number` order.
    pub fn insert_bays(&mut self, bays: Vec<RepairBay>) {
        self.bays.extend(bays);
        self.bays.sort_by_key(|b| b.bay_number);
    }

    pub fn remove_bays(&mut self, ids: &[Ulid]) -> Vec<RepairBay> {
        let (removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.bays).into_iter().partition(|b| ids.contains(&b.id));
        self.bays = kept;
        removed
    }

    pub fn reservation_count(&self) -> usize {
        self.reservation_days.len()
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        let date = self.reservation_days.get(id)?;
        self.days.get(date)?.iter().find(|r| r.id == *id)
    }

    pub fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        let date = self.reservation_days.get(id)?;
        self.days.get_mut(date)?.iter_mut().find(|r| r.id == *id)
    }

    /// Insert into the day bucket maintaining sort order by window start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        self.reservation_days.insert(reservation.id, reservation.date);
        let day = self.days.entry(reservation.date).or_default();
        let pos = day.partition_point(|r| r.window.start <= reservation.window.start);
        day.insert(pos, reservation);
    }

    /// Reservations on `date` whose window overlaps `window`, any status.
    /// Binary search skips everything starting at or after `window.end`.
    pub fn overlapping(&self, date: NaiveDate, window: Window) -> impl Iterator<Item = &Reservation> {
        let day = self.days.get(&date).map(Vec::as_slice).unwrap_or(&[]);
        let right_bound = day.partition_point(|r| r.window.start < window.end);
        day[..right_bound]
            .iter()
            .filter(move |r| r.window.end > window.start)
    }

    /// All reservations, by day then window start.
    pub fn reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.days.values().flatten()
    }
}

/// The WAL record format. Each variant is one durable mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    GarageCreated {
        id: Ulid,
        name: String,
        open_time: ClockTime,
        close_time: ClockTime,
    },
    GarageDeleted {
        id: Ulid,
    },
    BaysCreated {
        garage_id: Ulid,
        bays: Vec<RepairBay>,
    },
    BayToggled {
        garage_id: Ulid,
        bay_id: Ulid,
        active: bool,
    },
    BaysDeleted {
        garage_id: Ulid,
        bay_ids: Vec<Ulid>,
    },
    /// Carries the full record so compaction can snapshot any status.
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationConfirmed {
        id: Ulid,
        garage_id: Ulid,
        bay_id: Ulid,
    },
    ReservationCancelled {
        id: Ulid,
        garage_id: Ulid,
        reason: Option<String>,
    },
    ReservationStatusChanged {
        id: Ulid,
        garage_id: Ulid,
        status: ReservationStatus,
    },
}

impl Event {
    pub fn garage_id(&self) -> Ulid {
        match self {
            Event::GarageCreated { id, .. } | Event::GarageDeleted { id } => *id,
            Event::BaysCreated { garage_id, .. }
            | Event::BayToggled { garage_id, .. }
            | Event::BaysDeleted { garage_id, .. }
            | Event::ReservationConfirmed { garage_id, .. }
            | Event::ReservationCancelled { garage_id, .. }
            | Event::ReservationStatusChanged { garage_id, .. } => *garage_id,
            Event::ReservationCreated { reservation } => reservation.garage_id,
        }
    }
}

// ── Operation results ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GarageInfo {
    pub id: Ulid,
    pub name: String,
    pub open_time: ClockTime,
    pub close_time: ClockTime,
    pub bay_count: u32,
    pub active_bays: usize,
}

/// Outcome of removing a contiguous range of bay numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeDeletion {
    pub deleted_bays: Vec<Ulid>,
    pub cancelled: Vec<Ulid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResizeOutcome {
    pub created: Vec<RepairBay>,
    pub removed: RangeDeletion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub reservation_id: Ulid,
    pub bay_id: Ulid,
    pub bay_number: u32,
    /// Pending reservations cancelled because the window filled up.
    pub cascade_cancelled: Vec<Ulid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> ClockTime {
        ClockTime::parse(s).unwrap()
    }

    fn w(start: &str, end: &str) -> Window {
        Window::new(t(start), t(end)).unwrap()
    }

    fn reservation(date: NaiveDate, window: Window) -> Reservation {
        Reservation {
            id: Ulid::new(),
            user_id: Ulid::new(),
            garage_id: Ulid::new(),
            car_id: Ulid::new(),
            date,
            window,
            services: vec![],
            comment: None,
            status: ReservationStatus::Pending,
            paid: false,
            total_amount: 0,
            repair_bay_id: None,
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    #[test]
    fn clock_time_parse_and_display() {
        assert_eq!(t("00:00").minutes(), 0);
        assert_eq!(t("10:30").minutes(), 630);
        assert_eq!(t("23:59").to_string(), "23:59");
        assert_eq!(t("07:05").to_string(), "07:05");
    }

    #[test]
    fn clock_time_rejects_malformed() {
        for bad in ["24:00", "9:00", "09:60", "0900", "ab:cd", "09:00 ", ""] {
            assert!(ClockTime::parse(bad).is_none(), "{bad} should be rejected");
        }
    }

    #[test]
    fn window_requires_start_before_end() {
        assert!(Window::new(t("10:00"), t("10:00")).is_none());
        assert!(Window::new(t("11:00"), t("10:00")).is_none());
        assert_eq!(w("10:00", "11:30").duration_minutes(), 90);
    }

    #[test]
    fn window_overlap_is_half_open() {
        let a = w("10:00", "11:00");
        assert!(a.overlaps(&w("10:30", "11:30")));
        assert!(a.overlaps(&w("09:00", "12:00")));
        assert!(!a.overlaps(&w("11:00", "12:00")));
        assert!(!a.overlaps(&w("09:00", "10:00")));
    }

    #[test]
    fn status_predicates() {
        use ReservationStatus::*;
        assert!(!Pending.holds_capacity());
        assert!(Confirmed.holds_capacity() && InProgress.holds_capacity());
        assert!(!Completed.holds_capacity());
        assert!(Completed.occupies_bay());
        assert!(!Pending.occupies_bay() && !Cancelled.occupies_bay());
        assert!(Pending.is_live() && !Completed.is_live() && !Cancelled.is_live());
        assert_eq!(ReservationStatus::parse("IN_PROGRESS"), Some(InProgress));
        assert_eq!(ReservationStatus::parse("done"), None);
    }

    #[test]
    fn service_type_vocabulary() {
        assert_eq!(ServiceType::parse("oil_change"), Some(ServiceType::OilChange));
        assert_eq!(ServiceType::parse(" Brake_Pads "), Some(ServiceType::BrakePads));
        assert_eq!(ServiceType::parse("teleportation"), None);
        for tag in ServiceType::ALL {
            assert_eq!(ServiceType::parse(tag.as_str()), Some(tag));
        }
    }

    #[test]
    fn overlapping_filters_by_day_and_window() {
        let mut g = GarageState::new(Ulid::new(), "G".into(), t("08:00"), t("18:00"));
        let early = reservation(day(1), w("08:00", "09:00"));
        let mid = reservation(day(1), w("10:00", "11:00"));
        let late = reservation(day(1), w("14:00", "15:00"));
        let other_day = reservation(day(2), w("10:00", "11:00"));
        for r in [late.clone(), early.clone(), other_day.clone(), mid.clone()] {
            g.insert_reservation(r);
        }

        let hits: Vec<_> = g.overlapping(day(1), w("10:30", "14:00")).map(|r| r.id).collect();
        assert_eq!(hits, vec![mid.id]);
        assert_eq!(g.overlapping(day(3), w("00:00", "23:59")).count(), 0);
        assert_eq!(g.reservation_count(), 4);
    }

    #[test]
    fn day_bucket_sorted_by_start() {
        let mut g = GarageState::new(Ulid::new(), "G".into(), t("08:00"), t("18:00"));
        g.insert_reservation(reservation(day(1), w("14:00", "15:00")));
        g.insert_reservation(reservation(day(1), w("09:00", "10:00")));
        g.insert_reservation(reservation(day(1), w("11:00", "12:00")));
        let starts: Vec<_> = g.days[&day(1)].iter().map(|r| r.window.start.to_string()).collect();
        assert_eq!(starts, vec!["09:00", "11:00", "14:00"]);
    }

    #[test]
    fn reservation_lookup_and_mutation() {
        let mut g = GarageState::new(Ulid::new(), "G".into(), t("08:00"), t("18:00"));
        let r = reservation(day(4), w("09:00", "10:00"));
        g.insert_reservation(r.clone());
        g.reservation_mut(&r.id).unwrap().status = ReservationStatus::Confirmed;
        assert_eq!(g.reservation(&r.id).unwrap().status, ReservationStatus::Confirmed);
        assert!(g.reservation(&Ulid::new()).is_none());
    }

    #[test]
    fn bays_stay_sorted_and_remove_by_id() {
        let gid = Ulid::new();
        let mut g = GarageState::new(gid, "G".into(), t("08:00"), t("18:00"));
        let bays: Vec<_> = [3, 1, 2]
            .into_iter()
            .map(|n| RepairBay::new(gid, n, t("08:00"), t("18:00")))
            .collect();
        g.insert_bays(bays);
        assert_eq!(g.bays.iter().map(|b| b.bay_number).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(g.bay_count(), 3);

        let middle = g.bays[1].id;
        let removed = g.remove_bays(&[middle]);
        assert_eq!(removed.len(), 1);
        assert_eq!(g.bay_count(), 2);
        assert_eq!(g.max_bay_number(), 3);
        assert!(g.has_bay_number(3));
        assert!(!g.has_bay_number(2));
        assert_eq!(g.bays[0].name, "Bay 1");
    }

    #[test]
    fn cancellation_appends_reason() {
        let mut r = reservation(day(1), w("09:00", "10:00"));
        r.comment = Some("front left tyre".into());
        r.record_cancellation(Some("capacity reached"));
        assert_eq!(r.status, ReservationStatus::Cancelled);
        assert_eq!(r.comment.as_deref(), Some("front left tyre\ncapacity reached"));

        let mut bare = reservation(day(1), w("09:00", "10:00"));
        bare.record_cancellation(None);
        assert_eq!(bare.comment, None);
    }

    #[test]
    fn event_survives_bincode() {
        let event = Event::ReservationCreated {
            reservation: reservation(day(9), w("09:00", "10:00")),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
