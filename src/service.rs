//! Service layer API for the booking lifecycle, settlement and ratings
use crate::booking::{Booking, BookingDraft, BookingStatus, DateRange, TimeStamp};
use crate::cost::rental_cost;
use crate::error::LendingError;
use crate::geo::{LatLng, obfuscate_location};
use crate::rating::{MAX_SCORE, MIN_SCORE, Rating, RatingStore, percentage_mean, rounded_mean};
use crate::tool::{Tool, ToolStore};
use crate::user::UserStore;
use crate::utils::new_booking_id;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Page size shared by every listing operation.
pub const DEFAULT_PAGE_SIZE: usize = 16;

#[derive(Debug, Clone)]
pub struct LendingConfig {
    pub page_size: usize,
    /// Salt mixed into published locations. Threaded through here so
    /// obfuscation stays deterministic per deployment and controllable in
    /// tests, instead of living in a process-wide variable.
    pub obfuscation_salt: String,
}

impl Default for LendingConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            obfuscation_salt: String::new(),
        }
    }
}

/// What a user still has to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingActions {
    pub pending_ratings_count: u64,
    pub pending_requests_count: u64,
}

pub struct LendingService {
    bookings: sled::Tree,
    tools: ToolStore,
    users: UserStore,
    ratings: RatingStore,
    // per-tool serialisation of the accept transition; the conflict check and
    // the status write are not otherwise atomic
    accept_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    config: LendingConfig,
}

impl LendingService {
    pub fn new(instance: Arc<sled::Db>) -> anyhow::Result<Self> {
        Self::with_config(instance, LendingConfig::default())
    }

    pub fn with_config(instance: Arc<sled::Db>, config: LendingConfig) -> anyhow::Result<Self> {
        Ok(Self {
            bookings: instance.open_tree("bookings")?,
            tools: ToolStore::new(instance.open_tree("tools")?),
            users: UserStore::new(instance.open_tree("users")?),
            ratings: RatingStore::new(instance.open_tree("ratings")?),
            accept_locks: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn tools(&self) -> &ToolStore {
        &self.tools
    }

    pub fn users(&self) -> &UserStore {
        &self.users
    }

    pub fn ratings(&self) -> &RatingStore {
        &self.ratings
    }

    /// Submit a new booking request for a tool
    pub fn create_booking(&self, draft: BookingDraft) -> anyhow::Result<Booking> {
        let fields = draft.validate_and_finalise()?;

        let requester = self.users.get(&fields.from_user)?;
        let tool = self.tools.get(&fields.tool_id)?;

        // the counterparty is whoever holds the tool when the request is made;
        // for stationary tools that is always the owner
        let to_user = tool.actual_user_id.clone();
        if requester.id == to_user {
            return Err(LendingError::NotAuthorized.into());
        }

        if !self.dates_free(&tool, &fields.dates, None)? {
            return Err(LendingError::DatesConflict.into());
        }

        let now = TimeStamp::new();
        let booking = Booking {
            id: new_booking_id()?,
            tool_id: fields.tool_id,
            from_user: fields.from_user,
            to_user,
            dates: fields.dates,
            contact: fields.contact,
            comments: fields.comments,
            cost: 0,
            status: BookingStatus::Pending,
            created_at: now.clone(),
            updated_at: now,
        };
        self.store_booking(&booking)?;

        debug!("booking {} created for tool {}", booking.id, booking.tool_id);
        Ok(booking)
    }

    pub fn get_booking(&self, booking_id: &str) -> anyhow::Result<Booking> {
        self.load_booking(booking_id)
    }

    /// Accept a pending booking, holding the requester's tokens and blocking
    /// the tool's dates.
    ///
    /// The booking write, the balance debit and the reserved-dates push are
    /// three separate writes, not a transaction. When the tool-side write
    /// fails the already-applied writes are compensated best-effort, and a
    /// combined error surfaces when that compensation fails too.
    pub fn accept_booking(&self, booking_id: &str, actor_id: &str) -> anyhow::Result<Booking> {
        let booking = self.load_booking(booking_id)?;
        if booking.to_user != actor_id {
            return Err(LendingError::NotAuthorized.into());
        }

        // serialise accepts per tool so two overlapping requests cannot both
        // pass the conflict check
        let lock = self.accept_lock(&booking.tool_id);
        let _guard = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // reread now that we hold the lock
        let mut booking = self.load_booking(booking_id)?;
        Self::check_transition(&booking, BookingStatus::Accepted)?;

        let tool = self.tools.get(&booking.tool_id)?;
        if !self.dates_free(&tool, &booking.dates, Some(&booking.id))? {
            return Err(LendingError::DatesConflict.into());
        }

        let cost = rental_cost(&booking.dates, tool.daily_cost);
        self.users.try_debit_tokens(&booking.from_user, cost)?;

        let previous = minicbor::to_vec(&booking)?;
        booking.status = BookingStatus::Accepted;
        booking.cost = cost;
        booking.updated_at = TimeStamp::new();

        if let Err(original) = self.store_booking(&booking) {
            let rollback = self
                .users
                .credit_tokens(&booking.from_user, cost)
                .map(|_| ());
            return Err(Self::rollback_outcome("accept", original, rollback));
        }
        if let Err(original) =
            self.tools
                .push_reserved(&booking.tool_id, &booking.id, booking.dates.clone())
        {
            warn!(
                "reserved dates push failed for booking {}, reverting acceptance",
                booking.id
            );
            let rollback = self.restore_booking(&booking.id, &previous).and_then(|()| {
                self.users
                    .credit_tokens(&booking.from_user, cost)
                    .map(|_| ())
            });
            return Err(Self::rollback_outcome("accept", original, rollback));
        }

        info!(
            "booking {} accepted, {} tokens held from {}",
            booking.id, cost, booking.from_user
        );
        Ok(booking)
    }

    /// Turn down a pending booking request
    pub fn reject_booking(&self, booking_id: &str, actor_id: &str) -> anyhow::Result<Booking> {
        let mut booking = self.load_booking(booking_id)?;
        if booking.to_user != actor_id {
            return Err(LendingError::NotAuthorized.into());
        }
        Self::check_transition(&booking, BookingStatus::Rejected)?;

        booking.status = BookingStatus::Rejected;
        booking.updated_at = TimeStamp::new();
        self.store_booking(&booking)?;

        info!("booking {} rejected by {}", booking.id, actor_id);
        Ok(booking)
    }

    /// Cancel a booking. Cancelling an already accepted booking releases the
    /// tool's dates and refunds the requester's held tokens.
    pub fn cancel_booking(&self, booking_id: &str, actor_id: &str) -> anyhow::Result<Booking> {
        let mut booking = self.load_booking(booking_id)?;
        if !booking.is_party(actor_id) {
            return Err(LendingError::NotAuthorized.into());
        }
        Self::check_transition(&booking, BookingStatus::Cancelled)?;
        let was_accepted = booking.status == BookingStatus::Accepted;

        let previous = minicbor::to_vec(&booking)?;
        booking.status = BookingStatus::Cancelled;
        booking.updated_at = TimeStamp::new();
        self.store_booking(&booking)?;

        if was_accepted {
            if let Err(original) = self.tools.pull_reserved(&booking.tool_id, &booking.id) {
                warn!(
                    "reserved dates release failed for booking {}, reverting cancellation",
                    booking.id
                );
                let rollback = self.restore_booking(&booking.id, &previous);
                return Err(Self::rollback_outcome("cancel", original, rollback));
            }
            self.users
                .credit_tokens(&booking.from_user, booking.cost)?;
        }

        info!("booking {} cancelled by {}", booking.id, actor_id);
        Ok(booking)
    }

    /// Mark an accepted booking as picked up. For nomadic tools this hands
    /// custody to the requester and relocates the tool to their home.
    pub fn pick_up_booking(&self, booking_id: &str, actor_id: &str) -> anyhow::Result<Booking> {
        let mut booking = self.load_booking(booking_id)?;
        if booking.to_user != actor_id {
            return Err(LendingError::NotAuthorized.into());
        }
        Self::check_transition(&booking, BookingStatus::Picked)?;

        let tool = self.tools.get(&booking.tool_id)?;

        let previous = minicbor::to_vec(&booking)?;
        booking.status = BookingStatus::Picked;
        booking.updated_at = TimeStamp::new();
        self.store_booking(&booking)?;

        if tool.is_nomadic {
            let custody = self.users.get(&booking.from_user).and_then(|holder| {
                self.tools
                    .record_pickup(&booking.tool_id, &holder.id, holder.location, &booking.id)
            });
            if let Err(original) = custody {
                warn!(
                    "custody update failed for booking {}, reverting pickup",
                    booking.id
                );
                let rollback = self.restore_booking(&booking.id, &previous);
                return Err(Self::rollback_outcome("pickup", original, rollback));
            }
        }

        info!("booking {} picked up", booking.id);
        Ok(booking)
    }

    /// Conclude a picked-up booking: the lender is credited what the
    /// requester paid at acceptance and the tool's dates are released.
    pub fn return_booking(&self, booking_id: &str, actor_id: &str) -> anyhow::Result<Booking> {
        let mut booking = self.load_booking(booking_id)?;
        if booking.to_user != actor_id {
            return Err(LendingError::NotAuthorized.into());
        }
        Self::check_transition(&booking, BookingStatus::Returned)?;

        let previous = minicbor::to_vec(&booking)?;
        booking.status = BookingStatus::Returned;
        booking.updated_at = TimeStamp::new();
        self.store_booking(&booking)?;

        if let Err(original) = self.tools.pull_reserved(&booking.tool_id, &booking.id) {
            warn!(
                "reserved dates release failed for booking {}, reverting return",
                booking.id
            );
            let rollback = self.restore_booking(&booking.id, &previous);
            return Err(Self::rollback_outcome("return", original, rollback));
        }

        self.users.credit_tokens(&booking.to_user, booking.cost)?;

        info!(
            "booking {} returned, {} tokens credited to {}",
            booking.id, booking.cost, booking.to_user
        );
        Ok(booking)
    }

    /// Bookings where the user is either party
    pub fn user_bookings(&self, user_id: &str, page: usize) -> anyhow::Result<Vec<Booking>> {
        self.listing(page, |booking| booking.is_party(user_id))
    }

    /// Requests the user has sent as a borrower
    pub fn user_petitions(&self, user_id: &str, page: usize) -> anyhow::Result<Vec<Booking>> {
        self.listing(page, |booking| booking.from_user == user_id)
    }

    /// Requests the user has received as an owner or holder
    pub fn user_requests(&self, user_id: &str, page: usize) -> anyhow::Result<Vec<Booking>> {
        self.listing(page, |booking| booking.to_user == user_id)
    }

    /// Rate the counterparty of a concluded booking and refresh the tool and
    /// ratee aggregates.
    pub fn rate_booking(
        &self,
        booking_id: &str,
        rater_id: &str,
        score: u8,
        comment: Option<String>,
        images: Vec<String>,
    ) -> anyhow::Result<Rating> {
        // score bounds are checked before anything else is even looked up
        if !(MIN_SCORE..=MAX_SCORE).contains(&score) {
            return Err(LendingError::InvalidRatingValue(score).into());
        }

        let booking = self.load_booking(booking_id)?;
        if !self.booking_concluded(&booking)? {
            return Err(LendingError::InvalidBookingState {
                from: booking.status,
                action: "rating",
            }
            .into());
        }
        let ratee = booking
            .counterparty_of(rater_id)
            .ok_or(LendingError::NotAuthorized)?
            .to_string();

        let rating = Rating::new(&booking.id, rater_id, &ratee, score, comment, images);
        self.ratings.insert_new(&rating)?;

        self.recompute_tool_rating(&booking.tool_id)?;
        self.recompute_user_rating(&ratee)?;

        info!("rating stored for booking {} by {}", booking.id, rater_id);
        Ok(rating)
    }

    /// Concluded bookings the user has not rated yet, newest first. Each
    /// party's entry clears independently once they rate.
    pub fn pending_ratings(&self, user_id: &str) -> anyhow::Result<Vec<Booking>> {
        let mut pending = Vec::new();
        for booking in self.all_bookings()? {
            let Some(ratee) = booking.counterparty_of(user_id) else {
                continue;
            };
            if !self.booking_concluded(&booking)? {
                continue;
            }
            if self.ratings.exists(&booking.id, user_id, ratee)? {
                continue;
            }
            pending.push(booking);
        }
        pending.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(pending)
    }

    pub fn submitted_ratings(&self, user_id: &str, page: usize) -> anyhow::Result<Vec<Rating>> {
        Ok(self.paginate(self.ratings.by_rater(user_id)?, page))
    }

    pub fn received_ratings(&self, user_id: &str, page: usize) -> anyhow::Result<Vec<Rating>> {
        Ok(self.paginate(self.ratings.by_ratee(user_id)?, page))
    }

    /// Count what the user still has to act on: ratings they owe and booking
    /// requests waiting on them. `to_user` was pinned to the tool's holder
    /// when each request was created, so nomadic redirection needs no lookup
    /// here.
    pub fn count_pending_actions(&self, user_id: &str) -> anyhow::Result<PendingActions> {
        let pending_ratings_count = self.pending_ratings(user_id)?.len() as u64;
        let pending_requests_count = self
            .all_bookings()?
            .into_iter()
            .filter(|booking| {
                booking.status == BookingStatus::Pending && booking.to_user == user_id
            })
            .count() as u64;

        Ok(PendingActions {
            pending_ratings_count,
            pending_requests_count,
        })
    }

    /// The tool's published location, displaced with the configured salt.
    pub fn obfuscated_tool_location(&self, tool_id: &str) -> anyhow::Result<LatLng> {
        let tool = self.tools.get(tool_id)?;
        Ok(obfuscate_location(
            &tool.location,
            &self.config.obfuscation_salt,
        ))
    }

    /// Conflict check: reserved-dates cache pre-filter first, then the
    /// authoritative scan over accepted bookings for the tool.
    fn dates_free(
        &self,
        tool: &Tool,
        range: &DateRange,
        exclude: Option<&str>,
    ) -> anyhow::Result<bool> {
        let cached_conflict = tool.reserved_dates.iter().any(|reserved| {
            exclude != Some(reserved.booking_id.as_str()) && reserved.dates.overlaps(range)
        });
        if cached_conflict {
            return Ok(false);
        }

        for booking in self.bookings_for_tool(&tool.id)? {
            if exclude == Some(booking.id.as_str()) {
                continue;
            }
            if booking.status.blocks_dates() && booking.dates.overlaps(range) {
                debug!("dates conflict with booking {}", booking.id);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// A booking can be rated once it is returned, or once a nomadic tool has
    /// been picked up and custody moved on.
    fn booking_concluded(&self, booking: &Booking) -> anyhow::Result<bool> {
        match booking.status {
            BookingStatus::Returned => Ok(true),
            BookingStatus::Picked => Ok(self.tools.get(&booking.tool_id)?.is_nomadic),
            _ => Ok(false),
        }
    }

    fn recompute_tool_rating(&self, tool_id: &str) -> anyhow::Result<()> {
        let mut scores = Vec::new();
        for rating in self.ratings.all()? {
            let Some(booking) = self.find_booking(&rating.booking_id)? else {
                continue;
            };
            if booking.tool_id == tool_id {
                scores.push(rating.score);
            }
        }
        if let Some(mean) = rounded_mean(&scores) {
            self.tools.set_rating(tool_id, mean)?;
        }
        Ok(())
    }

    fn recompute_user_rating(&self, user_id: &str) -> anyhow::Result<()> {
        let scores: Vec<u8> = self
            .ratings
            .by_ratee(user_id)?
            .into_iter()
            .filter(|rating| rating.rater_id != rating.ratee_id)
            .map(|rating| rating.score)
            .collect();
        if let Some(mean) = percentage_mean(&scores) {
            self.users.set_rating(user_id, mean, scores.len() as u32)?;
        }
        Ok(())
    }

    fn check_transition(booking: &Booking, next: BookingStatus) -> Result<(), LendingError> {
        if booking.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(LendingError::InvalidBookingState {
                from: booking.status,
                action: next.as_str(),
            })
        }
    }

    fn rollback_outcome(
        operation: &'static str,
        original: anyhow::Error,
        rollback: anyhow::Result<()>,
    ) -> anyhow::Error {
        match rollback {
            Ok(()) => {
                original.context(format!("{operation} side effects reverted after a partial write"))
            }
            Err(rollback) => LendingError::RollbackFailed {
                operation,
                original: original.to_string(),
                rollback: rollback.to_string(),
            }
            .into(),
        }
    }

    fn accept_lock(&self, tool_id: &str) -> Arc<Mutex<()>> {
        let mut locks = match self.accept_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(tool_id.to_string()).or_default().clone()
    }

    fn listing<F: Fn(&Booking) -> bool>(
        &self,
        page: usize,
        keep: F,
    ) -> anyhow::Result<Vec<Booking>> {
        let now = TimeStamp::new();
        let mut bookings: Vec<Booking> = self
            .all_bookings()?
            .into_iter()
            .filter(|booking| keep(booking))
            .collect();

        // upcoming pending requests surface first, then newest creations,
        // with the id as the final tie break
        bookings.sort_by(|a, b| {
            b.is_future_pending(&now)
                .cmp(&a.is_future_pending(&now))
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(self.paginate(bookings, page))
    }

    fn paginate<T>(&self, items: Vec<T>, page: usize) -> Vec<T> {
        items
            .into_iter()
            .skip(page * self.config.page_size)
            .take(self.config.page_size)
            .collect()
    }

    fn load_booking(&self, booking_id: &str) -> anyhow::Result<Booking> {
        let booking = self
            .find_booking(booking_id)?
            .ok_or_else(|| LendingError::NotFound(booking_id.to_string()))?;
        Ok(booking)
    }

    fn find_booking(&self, booking_id: &str) -> anyhow::Result<Option<Booking>> {
        let Some(bytes) = self.bookings.get(booking_id.as_bytes())? else {
            return Ok(None);
        };
        Ok(Some(minicbor::decode(bytes.as_ref())?))
    }

    fn store_booking(&self, booking: &Booking) -> anyhow::Result<()> {
        self.bookings
            .insert(booking.id.as_bytes(), minicbor::to_vec(booking)?)?;
        Ok(())
    }

    fn restore_booking(&self, booking_id: &str, previous: &[u8]) -> anyhow::Result<()> {
        self.bookings.insert(booking_id.as_bytes(), previous)?;
        Ok(())
    }

    fn bookings_for_tool(&self, tool_id: &str) -> anyhow::Result<Vec<Booking>> {
        Ok(self
            .all_bookings()?
            .into_iter()
            .filter(|booking| booking.tool_id == tool_id)
            .collect())
    }

    fn all_bookings(&self) -> anyhow::Result<Vec<Booking>> {
        let mut bookings = Vec::new();
        for entry in self.bookings.iter() {
            let (_, bytes) = entry?;
            bookings.push(minicbor::decode(bytes.as_ref())?);
        }
        Ok(bookings)
    }
}
