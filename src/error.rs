//! Domain error taxonomy for the lending engine

use crate::booking::BookingStatus;

#[derive(thiserror::Error, Debug)]
pub enum LendingError {
    #[error("No record found for id({0})")]
    NotFound(String),
    #[error("Requested dates overlap an accepted booking for this tool")]
    DatesConflict,
    #[error("{action} is not permitted while the booking is {from}")]
    InvalidBookingState {
        from: BookingStatus,
        action: &'static str,
    },
    #[error("Requester holds {available} tokens but the booking costs {required}")]
    InsufficientTokens { required: u64, available: u64 },
    #[error("Rating score {0} is outside the accepted 1..=5 range")]
    InvalidRatingValue(u8),
    #[error("A rating from this rater already exists for this booking")]
    AlreadyRated,
    #[error("Actor is not a party to this booking")]
    NotAuthorized,
    #[error("{operation} failed ({original}) and the compensating rollback also failed ({rollback})")]
    RollbackFailed {
        operation: &'static str,
        original: String,
        rollback: String,
    },
}
