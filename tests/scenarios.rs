//! End-to-end walks through the booking lifecycle against a real store.

use anyhow::Context;
use std::sync::Arc;
use tempfile::{TempDir, tempdir};
use tool_lending::{
    booking::{BookingDraft, BookingStatus, TimeStamp},
    error::LendingError,
    geo::{LatLng, OBFUSCATION_RADIUS_M, within_distance_m},
    service::LendingService,
    tool::Tool,
    user::User,
};

// Sled uses file-based locking to prevent concurrent access, so each test
// opens its own database under a temp dir for simplified cleanup.
fn open_service(db_name: &str) -> anyhow::Result<(TempDir, LendingService)> {
    let temp_dir = tempdir()?;
    let db = sled::open(temp_dir.path().join(db_name))?;
    let service = LendingService::new(Arc::new(db))?;
    Ok((temp_dir, service))
}

fn seed_user(
    service: &LendingService,
    name: &str,
    tokens: u64,
    location: LatLng,
) -> anyhow::Result<User> {
    let user = User::new(name, tokens, location)?;
    service.users().insert(&user)?;
    Ok(user)
}

fn seed_tool(service: &LendingService, owner: &User, daily_cost: u64) -> anyhow::Result<Tool> {
    let tool = Tool::new(&owner.id, "angle grinder", daily_cost, owner.location)?;
    service.tools().insert(&tool)?;
    Ok(tool)
}

fn draft_for_days(tool: &Tool, requester: &User, start_day: u32, end_day: u32) -> BookingDraft {
    BookingDraft::new()
        .for_tool(&tool.id)
        .from_requester(&requester.id)
        .set_start(TimeStamp::new_with(2030, 5, start_day, 9, 0, 0))
        .set_end(TimeStamp::new_with(2030, 5, end_day, 9, 0, 0))
        .set_contact("reachable evenings")
}

fn barcelona() -> LatLng {
    LatLng::from_degrees(41.3874, 2.1686)
}

fn girona() -> LatLng {
    LatLng::from_degrees(41.9794, 2.8214)
}

#[test]
fn full_lifecycle_settles_tokens_and_ratings() -> anyhow::Result<()> {
    let (_temp_dir, service) = open_service("full_lifecycle.db")?;

    let owner = seed_user(&service, "nuria", 0, barcelona())?;
    let borrower = seed_user(&service, "pau", 1_000, girona())?;
    let tool = seed_tool(&service, &owner, 100)?;

    // two full days at 100 tokens a day
    let booking = service
        .create_booking(draft_for_days(&tool, &borrower, 1, 3))
        .context("Booking failed on create: ")?;
    assert_eq!(booking.status, BookingStatus::Pending);
    assert_eq!(booking.to_user, owner.id);

    let actions = service.count_pending_actions(&owner.id)?;
    assert_eq!(actions.pending_requests_count, 1);

    let booking = service
        .accept_booking(&booking.id, &owner.id)
        .context("Booking failed on accept: ")?;
    assert_eq!(booking.status, BookingStatus::Accepted);
    assert_eq!(booking.cost, 200);
    assert_eq!(service.users().get(&borrower.id)?.tokens, 800);
    assert_eq!(service.tools().get(&tool.id)?.reserved_dates.len(), 1);

    let booking = service.pick_up_booking(&booking.id, &owner.id)?;
    assert_eq!(booking.status, BookingStatus::Picked);
    // stationary tools never change hands
    assert_eq!(service.tools().get(&tool.id)?.actual_user_id, owner.id);

    let booking = service.return_booking(&booking.id, &owner.id)?;
    assert_eq!(booking.status, BookingStatus::Returned);
    assert_eq!(service.users().get(&owner.id)?.tokens, 200);
    assert!(service.tools().get(&tool.id)?.reserved_dates.is_empty());

    // both parties owe each other a rating now
    assert_eq!(service.pending_ratings(&owner.id)?.len(), 1);
    assert_eq!(service.pending_ratings(&borrower.id)?.len(), 1);

    service.rate_booking(&booking.id, &borrower.id, 5, Some("great owner".into()), vec![])?;
    assert!(service.pending_ratings(&borrower.id)?.is_empty());
    assert_eq!(service.pending_ratings(&owner.id)?.len(), 1);
    assert_eq!(service.users().get(&owner.id)?.rating, 100);
    assert_eq!(service.users().get(&owner.id)?.rating_count, 1);

    service.rate_booking(&booking.id, &owner.id, 4, None, vec![])?;
    assert!(service.pending_ratings(&owner.id)?.is_empty());
    assert_eq!(service.users().get(&borrower.id)?.rating, 80);

    // the tool aggregate covers both directions: round((5 + 4) / 2) = 5
    assert_eq!(service.tools().get(&tool.id)?.rating, 5);

    assert_eq!(service.submitted_ratings(&borrower.id, 0)?.len(), 1);
    assert_eq!(service.received_ratings(&borrower.id, 0)?.len(), 1);

    Ok(())
}

#[test]
fn accepting_without_cover_changes_nothing() -> anyhow::Result<()> {
    let (_temp_dir, service) = open_service("insufficient_tokens.db")?;

    let owner = seed_user(&service, "nuria", 0, barcelona())?;
    let borrower = seed_user(&service, "pau", 100, girona())?;
    let tool = seed_tool(&service, &owner, 100)?;

    let booking = service.create_booking(draft_for_days(&tool, &borrower, 1, 3))?;

    let err = service.accept_booking(&booking.id, &owner.id).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LendingError>(),
        Some(LendingError::InsufficientTokens {
            required: 200,
            available: 100
        })
    ));

    // the failed accept left every record untouched
    assert_eq!(service.get_booking(&booking.id)?.status, BookingStatus::Pending);
    assert_eq!(service.users().get(&borrower.id)?.tokens, 100);
    assert_eq!(service.users().get(&owner.id)?.tokens, 0);
    assert!(service.tools().get(&tool.id)?.reserved_dates.is_empty());

    Ok(())
}

#[test]
fn overlapping_requests_conflict() -> anyhow::Result<()> {
    let (_temp_dir, service) = open_service("conflicts.db")?;

    let owner = seed_user(&service, "nuria", 0, barcelona())?;
    let first = seed_user(&service, "pau", 1_000, girona())?;
    let second = seed_user(&service, "marta", 1_000, girona())?;
    let tool = seed_tool(&service, &owner, 10)?;

    // two pending requests may overlap, only acceptance blocks dates
    let first_booking = service.create_booking(draft_for_days(&tool, &first, 10, 12))?;
    let second_booking = service.create_booking(draft_for_days(&tool, &second, 11, 13))?;

    service.accept_booking(&first_booking.id, &owner.id)?;

    let err = service
        .accept_booking(&second_booking.id, &owner.id)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LendingError>(),
        Some(LendingError::DatesConflict)
    ));

    // new requests against the accepted range fail at creation; the interval
    // is closed, so a range that merely touches the end day still conflicts
    let err = service
        .create_booking(draft_for_days(&tool, &second, 12, 14))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LendingError>(),
        Some(LendingError::DatesConflict)
    ));

    // a clear gap is fine
    let later = service.create_booking(draft_for_days(&tool, &second, 13, 14))?;
    service.accept_booking(&later.id, &owner.id)?;

    Ok(())
}

#[test]
fn nomadic_custody_moves_with_pickup() -> anyhow::Result<()> {
    let (_temp_dir, service) = open_service("nomadic.db")?;

    let owner = seed_user(&service, "nuria", 0, barcelona())?;
    let borrower = seed_user(&service, "pau", 1_000, girona())?;
    let next_borrower = seed_user(&service, "marta", 1_000, barcelona())?;

    let tool = Tool::new(&owner.id, "tile cutter", 10, owner.location)?.nomadic();
    service.tools().insert(&tool)?;

    let booking = service.create_booking(draft_for_days(&tool, &borrower, 1, 2))?;
    let booking = service.accept_booking(&booking.id, &owner.id)?;
    let booking = service.pick_up_booking(&booking.id, &owner.id)?;

    let moved = service.tools().get(&tool.id)?;
    assert_eq!(moved.actual_user_id, borrower.id);
    assert_eq!(moved.location, borrower.location);
    assert_eq!(moved.custody_history.len(), 1);
    assert_eq!(moved.custody_history[0].booking_id, booking.id);
    assert_eq!(moved.custody_history[0].user_id, borrower.id);

    // the published location is displaced from the holder's home, but never
    // further than the obfuscation radius
    let published = service.obfuscated_tool_location(&tool.id)?;
    assert!(within_distance_m(
        &borrower.location,
        &published,
        OBFUSCATION_RADIUS_M
    ));

    // a nomadic pickup concludes the loan, so rating opens up right away
    service.rate_booking(&booking.id, &borrower.id, 5, None, vec![])?;

    // the next request goes to the current holder, not the original owner
    let chained = service.create_booking(draft_for_days(&tool, &next_borrower, 5, 6))?;
    assert_eq!(chained.to_user, borrower.id);
    assert_eq!(
        service.count_pending_actions(&borrower.id)?.pending_requests_count,
        1
    );
    assert_eq!(
        service.count_pending_actions(&owner.id)?.pending_requests_count,
        0
    );

    Ok(())
}

#[test]
fn cancelling_an_accepted_booking_releases_and_refunds() -> anyhow::Result<()> {
    let (_temp_dir, service) = open_service("cancel.db")?;

    let owner = seed_user(&service, "nuria", 0, barcelona())?;
    let borrower = seed_user(&service, "pau", 1_000, girona())?;
    let tool = seed_tool(&service, &owner, 100)?;

    let booking = service.create_booking(draft_for_days(&tool, &borrower, 1, 3))?;
    service.accept_booking(&booking.id, &owner.id)?;
    assert_eq!(service.users().get(&borrower.id)?.tokens, 800);

    let booking = service.cancel_booking(&booking.id, &borrower.id)?;
    assert_eq!(booking.status, BookingStatus::Cancelled);
    assert_eq!(service.users().get(&borrower.id)?.tokens, 1_000);
    assert!(service.tools().get(&tool.id)?.reserved_dates.is_empty());

    // the released range can be booked again
    let again = service.create_booking(draft_for_days(&tool, &borrower, 1, 3))?;
    service.accept_booking(&again.id, &owner.id)?;

    Ok(())
}

#[test]
fn transitions_outside_the_table_are_rejected() -> anyhow::Result<()> {
    let (_temp_dir, service) = open_service("transitions.db")?;

    let owner = seed_user(&service, "nuria", 0, barcelona())?;
    let borrower = seed_user(&service, "pau", 1_000, girona())?;
    let tool = seed_tool(&service, &owner, 10)?;

    let booking = service.create_booking(draft_for_days(&tool, &borrower, 1, 2))?;

    // returning a booking that was never picked up
    let err = service.return_booking(&booking.id, &owner.id).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LendingError>(),
        Some(LendingError::InvalidBookingState { .. })
    ));

    // only the counterparty drives owner-side transitions
    let err = service.reject_booking(&booking.id, &borrower.id).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LendingError>(),
        Some(LendingError::NotAuthorized)
    ));

    let booking = service.accept_booking(&booking.id, &owner.id)?;

    // accepting twice re-runs no side effects, it fails the table check
    let err = service.accept_booking(&booking.id, &owner.id).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LendingError>(),
        Some(LendingError::InvalidBookingState { .. })
    ));
    assert_eq!(service.users().get(&borrower.id)?.tokens, 990);

    // a fresh request on clear dates can still be turned down
    let second = service.create_booking(draft_for_days(&tool, &borrower, 20, 21))?;
    let second = service.reject_booking(&second.id, &owner.id)?;
    assert_eq!(second.status, BookingStatus::Rejected);

    Ok(())
}

#[test]
fn listing_surfaces_upcoming_requests_first() -> anyhow::Result<()> {
    let (_temp_dir, service) = open_service("listing.db")?;

    let owner = seed_user(&service, "nuria", 0, barcelona())?;
    let borrower = seed_user(&service, "pau", 1_000, girona())?;
    let tool = seed_tool(&service, &owner, 10)?;

    // a concluded past loan, created first
    let done = service.create_booking(draft_for_days(&tool, &borrower, 1, 2))?;
    let done = service.accept_booking(&done.id, &owner.id)?;
    let done = service.pick_up_booking(&done.id, &owner.id)?;
    let done = service.return_booking(&done.id, &owner.id)?;

    // a fresh upcoming request, created later
    let upcoming = service.create_booking(draft_for_days(&tool, &borrower, 20, 21))?;

    let requests = service.user_requests(&owner.id, 0)?;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].id, upcoming.id);
    assert_eq!(requests[1].id, done.id);

    let petitions = service.user_petitions(&borrower.id, 0)?;
    assert_eq!(petitions.len(), 2);
    assert!(service.user_petitions(&owner.id, 0)?.is_empty());

    // page past the end comes back empty
    assert!(service.user_bookings(&borrower.id, 1)?.is_empty());

    Ok(())
}

#[test]
fn double_rating_is_rejected() -> anyhow::Result<()> {
    let (_temp_dir, service) = open_service("double_rating.db")?;

    let owner = seed_user(&service, "nuria", 0, barcelona())?;
    let borrower = seed_user(&service, "pau", 1_000, girona())?;
    let tool = seed_tool(&service, &owner, 10)?;

    let booking = service.create_booking(draft_for_days(&tool, &borrower, 1, 2))?;
    service.accept_booking(&booking.id, &owner.id)?;
    service.pick_up_booking(&booking.id, &owner.id)?;
    service.return_booking(&booking.id, &owner.id)?;

    service.rate_booking(&booking.id, &borrower.id, 4, None, vec![])?;

    let err = service
        .rate_booking(&booking.id, &borrower.id, 5, None, vec![])
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LendingError>(),
        Some(LendingError::AlreadyRated)
    ));

    // an outsider cannot rate at all
    let outsider = seed_user(&service, "marta", 0, barcelona())?;
    let err = service
        .rate_booking(&booking.id, &outsider.id, 5, None, vec![])
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LendingError>(),
        Some(LendingError::NotAuthorized)
    ));

    Ok(())
}
