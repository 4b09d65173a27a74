//! Booking entity, status state machine and date-range arithmetic

use chrono::{DateTime, TimeZone, Utc};
use std::fmt;

/// Lifecycle of a booking. The persisted representation is the literal status
/// string, so documents stay readable by the other services sharing the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingStatus {
    Pending,
    Accepted,
    Rejected,
    Cancelled,
    Picked,
    Returned,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Accepted => "ACCEPTED",
            BookingStatus::Rejected => "REJECTED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Picked => "PICKED",
            BookingStatus::Returned => "RETURNED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(BookingStatus::Pending),
            "ACCEPTED" => Some(BookingStatus::Accepted),
            "REJECTED" => Some(BookingStatus::Rejected),
            "CANCELLED" => Some(BookingStatus::Cancelled),
            "PICKED" => Some(BookingStatus::Picked),
            "RETURNED" => Some(BookingStatus::Returned),
            _ => None,
        }
    }

    /// Single source of truth for legal transitions. Every status write in the
    /// service layer goes through this table.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;

        matches!(
            (self, next),
            (Pending, Accepted)
                | (Pending, Rejected)
                | (Pending, Cancelled)
                | (Accepted, Picked)
                | (Accepted, Cancelled)
                | (Picked, Returned)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Rejected | BookingStatus::Cancelled | BookingStatus::Returned
        )
    }

    /// Statuses that hold their date range against other bookings.
    pub fn blocks_dates(&self) -> bool {
        matches!(self, BookingStatus::Accepted | BookingStatus::Picked)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<C> minicbor::Encode<C> for BookingStatus {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(self.as_str())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for BookingStatus {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let value = d.str()?;

        BookingStatus::parse(value)
            .ok_or_else(|| minicbor::decode::Error::message("unknown booking status"))
    }
}

#[derive(Debug, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

// `#[derive(Ord)]` would add a spurious `T: Ord` bound, which `Utc` does not
// satisfy. `DateTime<T>` is always totally ordered, so delegate to it directly.
impl<T: TimeZone> PartialEq for TimeStamp<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T: TimeZone> Eq for TimeStamp<T> {}

impl<T: TimeZone> PartialOrd for TimeStamp<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: TimeZone> Ord for TimeStamp<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Closed interval of loan dates. Two ranges conflict when
/// `start_a <= end_b && end_a >= start_b`, so touching endpoints count.
#[derive(minicbor::Encode, minicbor::Decode, Debug, PartialEq, Eq, Clone)]
pub struct DateRange {
    #[n(0)]
    pub start: TimeStamp<Utc>,
    #[n(1)]
    pub end: TimeStamp<Utc>,
}

impl DateRange {
    pub fn new(start: TimeStamp<Utc>, end: TimeStamp<Utc>) -> Self {
        Self { start, end }
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, PartialEq, Clone)]
pub struct Booking {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub tool_id: String,
    #[n(2)]
    pub from_user: String,
    #[n(3)]
    pub to_user: String,
    #[n(4)]
    pub dates: DateRange,
    #[n(5)]
    pub contact: Option<String>,
    #[n(6)]
    pub comments: Option<String>,
    #[n(7)]
    pub cost: u64, // fixed when the booking is accepted
    #[n(8)]
    pub status: BookingStatus,
    #[n(9)]
    pub created_at: TimeStamp<Utc>,
    #[n(10)]
    pub updated_at: TimeStamp<Utc>,
}

impl Booking {
    pub fn is_party(&self, user_id: &str) -> bool {
        self.from_user == user_id || self.to_user == user_id
    }

    /// The other side of the booking, if `user_id` is a party at all.
    pub fn counterparty_of(&self, user_id: &str) -> Option<&str> {
        if self.from_user == user_id {
            Some(self.to_user.as_str())
        } else if self.to_user == user_id {
            Some(self.from_user.as_str())
        } else {
            None
        }
    }

    pub fn is_future_pending(&self, now: &TimeStamp<Utc>) -> bool {
        self.status == BookingStatus::Pending && self.dates.start > *now
    }
}

/// Fields of a validated booking draft, ready to be persisted.
pub struct DraftFields {
    pub tool_id: String,
    pub from_user: String,
    pub dates: DateRange,
    pub contact: Option<String>,
    pub comments: Option<String>,
}

// Also used for constructing request payloads before submission
#[derive(Debug, Default)]
pub struct BookingDraft {
    tool_id: Option<String>,
    from_user: Option<String>,
    start: Option<TimeStamp<Utc>>,
    end: Option<TimeStamp<Utc>>,
    contact: Option<String>,
    comments: Option<String>,
}

impl BookingDraft {
    /// Construct a new builder object, this becomes the basis for a request
    pub fn new() -> Self {
        Self::default()
    }
    pub fn for_tool(mut self, tool_id: &str) -> Self {
        self.tool_id = Some(tool_id.to_string());
        self
    }
    pub fn from_requester(mut self, user_id: &str) -> Self {
        self.from_user = Some(user_id.to_string());
        self
    }
    pub fn set_start(mut self, start: TimeStamp<Utc>) -> Self {
        self.start = Some(start);
        self
    }
    pub fn set_end(mut self, end: TimeStamp<Utc>) -> Self {
        self.end = Some(end);
        self
    }
    pub fn set_contact(mut self, contact: &str) -> Self {
        self.contact = Some(contact.to_string());
        self
    }
    pub fn set_comments(mut self, comments: &str) -> Self {
        self.comments = Some(comments.to_string());
        self
    }

    /// Checks if the predicate `start <= end` is true for the drafted range
    pub fn validate_dates(&self) -> bool {
        match (self.start.as_ref(), self.end.as_ref()) {
            (Some(start), Some(end)) => start <= end,
            _ => false,
        }
    }

    // Checks fields, then hands the validated pieces back for persistence
    pub fn validate_and_finalise(self) -> anyhow::Result<DraftFields> {
        let Some(tool_id) = self.tool_id else {
            return Err(anyhow::Error::msg("Tool reference is not set"));
        };
        let Some(from_user) = self.from_user else {
            return Err(anyhow::Error::msg("Requester is not set"));
        };
        let (Some(start), Some(end)) = (self.start, self.end) else {
            return Err(anyhow::Error::msg("Booking range is not fully set"));
        };
        if start > end {
            return Err(anyhow::Error::msg("Booking range starts after it ends"));
        }

        Ok(DraftFields {
            tool_id,
            from_user,
            dates: DateRange::new(start, end),
            contact: self.contact,
            comments: self.comments,
        })
    }
}
