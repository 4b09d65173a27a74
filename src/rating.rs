//! Rating records and aggregate recomputation

use crate::booking::TimeStamp;
use crate::error::LendingError;
use chrono::Utc;

pub const MIN_SCORE: u8 = 1;
pub const MAX_SCORE: u8 = 5;

/// One party's score for the other party of a concluded booking. Never
/// updated or deleted; aggregates are recomputed from the full set.
#[derive(minicbor::Encode, minicbor::Decode, Debug, PartialEq, Clone)]
pub struct Rating {
    #[n(0)]
    pub booking_id: String,
    #[n(1)]
    pub rater_id: String, // the from_user of the stored document
    #[n(2)]
    pub ratee_id: String, // the to_user of the stored document
    #[n(3)]
    pub score: u8,
    #[n(4)]
    pub comment: Option<String>,
    #[n(5)]
    pub images: Vec<String>, // content hashes held by the image subsystem
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
}

impl Rating {
    pub fn new(
        booking_id: &str,
        rater_id: &str,
        ratee_id: &str,
        score: u8,
        comment: Option<String>,
        images: Vec<String>,
    ) -> Self {
        Self {
            booking_id: booking_id.to_string(),
            rater_id: rater_id.to_string(),
            ratee_id: ratee_id.to_string(),
            score,
            comment,
            images,
            created_at: TimeStamp::new(),
        }
    }

    /// Storage key for the (booking, rater, ratee) direction. Deriving the key
    /// from the triple makes the uniqueness constraint a plain key collision.
    pub fn direction_key(booking_id: &str, rater_id: &str, ratee_id: &str) -> String {
        sha256::digest(format!("{booking_id}|{rater_id}|{ratee_id}"))
    }

    pub fn key(&self) -> String {
        Self::direction_key(&self.booking_id, &self.rater_id, &self.ratee_id)
    }
}

/// Mean of the given scores rounded to the nearest whole star, for the tool
/// aggregate. `None` when there are no scores yet.
pub fn rounded_mean(scores: &[u8]) -> Option<u8> {
    if scores.is_empty() {
        return None;
    }

    let sum: u64 = scores.iter().map(|score| *score as u64).sum();
    Some((sum as f64 / scores.len() as f64).round() as u8)
}

/// Mean of the given scores scaled to a 0..=100 percentage, for the user
/// aggregate (each star is worth 20 points).
pub fn percentage_mean(scores: &[u8]) -> Option<u8> {
    if scores.is_empty() {
        return None;
    }

    let sum: u64 = scores.iter().map(|score| *score as u64).sum();
    Some((sum as f64 * 20.0 / scores.len() as f64).round() as u8)
}

/// Narrow interface over the `ratings` tree.
pub struct RatingStore {
    tree: sled::Tree,
}

impl RatingStore {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    /// Persist a rating, failing with `AlreadyRated` when this direction of
    /// the booking has been rated before.
    pub fn insert_new(&self, rating: &Rating) -> anyhow::Result<()> {
        let key = rating.key();
        if self.tree.contains_key(key.as_bytes())? {
            return Err(LendingError::AlreadyRated.into());
        }

        self.tree.insert(key.as_bytes(), minicbor::to_vec(rating)?)?;
        Ok(())
    }

    pub fn exists(&self, booking_id: &str, rater_id: &str, ratee_id: &str) -> anyhow::Result<bool> {
        let key = Rating::direction_key(booking_id, rater_id, ratee_id);
        Ok(self.tree.contains_key(key.as_bytes())?)
    }

    /// Full scan of the collection; aggregation recomputes from this on every
    /// new rating, which is fine at marketplace scale.
    pub fn all(&self) -> anyhow::Result<Vec<Rating>> {
        let mut ratings = Vec::new();
        for entry in self.tree.iter() {
            let (_, bytes) = entry?;
            ratings.push(minicbor::decode(bytes.as_ref())?);
        }
        Ok(ratings)
    }

    pub fn by_rater(&self, rater_id: &str) -> anyhow::Result<Vec<Rating>> {
        let mut ratings: Vec<Rating> = self
            .all()?
            .into_iter()
            .filter(|rating| rating.rater_id == rater_id)
            .collect();
        ratings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(ratings)
    }

    pub fn by_ratee(&self, ratee_id: &str) -> anyhow::Result<Vec<Rating>> {
        let mut ratings: Vec<Rating> = self
            .all()?
            .into_iter()
            .filter(|rating| rating.ratee_id == ratee_id)
            .collect();
        ratings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(ratings)
    }
}
