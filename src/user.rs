//! User records and the token ledger

use crate::error::LendingError;
use crate::geo::LatLng;
use crate::utils::new_user_id;

#[derive(minicbor::Encode, minicbor::Decode, Debug, PartialEq, Clone)]
pub struct User {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub tokens: u64,
    #[n(3)]
    pub rating: u8, // received score mean scaled to 0..=100
    #[n(4)]
    pub rating_count: u32,
    #[n(5)]
    pub location: LatLng,
}

impl User {
    pub fn new(name: &str, tokens: u64, location: LatLng) -> anyhow::Result<Self> {
        Ok(Self {
            id: new_user_id()?,
            name: name.to_string(),
            tokens,
            rating: 0,
            rating_count: 0,
            location,
        })
    }
}

/// Narrow interface over the `users` tree. Balance changes go through
/// compare-and-swap loops so concurrent settlements never lose an increment.
pub struct UserStore {
    tree: sled::Tree,
}

impl UserStore {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    pub fn insert(&self, user: &User) -> anyhow::Result<()> {
        self.tree
            .insert(user.id.as_bytes(), minicbor::to_vec(user)?)?;
        Ok(())
    }

    pub fn get(&self, user_id: &str) -> anyhow::Result<User> {
        let bytes = self
            .tree
            .get(user_id.as_bytes())?
            .ok_or_else(|| LendingError::NotFound(user_id.to_string()))?;

        Ok(minicbor::decode(bytes.as_ref())?)
    }

    /// Add tokens to a balance, returning the balance after the credit.
    pub fn credit_tokens(&self, user_id: &str, amount: u64) -> anyhow::Result<u64> {
        self.swap_balance(user_id, |tokens| Ok(tokens.saturating_add(amount)))
    }

    /// Remove tokens from a balance, failing with `InsufficientTokens` before
    /// any write when the balance cannot cover the amount.
    pub fn try_debit_tokens(&self, user_id: &str, amount: u64) -> anyhow::Result<u64> {
        self.swap_balance(user_id, |tokens| {
            if tokens < amount {
                return Err(LendingError::InsufficientTokens {
                    required: amount,
                    available: tokens,
                }
                .into());
            }
            Ok(tokens - amount)
        })
    }

    pub fn set_rating(&self, user_id: &str, rating: u8, rating_count: u32) -> anyhow::Result<()> {
        loop {
            let current = self
                .tree
                .get(user_id.as_bytes())?
                .ok_or_else(|| LendingError::NotFound(user_id.to_string()))?;
            let mut user: User = minicbor::decode(current.as_ref())?;
            user.rating = rating;
            user.rating_count = rating_count;

            let swap = self.tree.compare_and_swap(
                user_id.as_bytes(),
                Some(&current),
                Some(minicbor::to_vec(&user)?),
            )?;
            if swap.is_ok() {
                return Ok(());
            }
        }
    }

    fn swap_balance<F>(&self, user_id: &str, next: F) -> anyhow::Result<u64>
    where
        F: Fn(u64) -> anyhow::Result<u64>,
    {
        loop {
            let current = self
                .tree
                .get(user_id.as_bytes())?
                .ok_or_else(|| LendingError::NotFound(user_id.to_string()))?;
            let mut user: User = minicbor::decode(current.as_ref())?;
            user.tokens = next(user.tokens)?;

            let swap = self.tree.compare_and_swap(
                user_id.as_bytes(),
                Some(&current),
                Some(minicbor::to_vec(&user)?),
            )?;
            if swap.is_ok() {
                return Ok(user.tokens);
            }
            // lost a race against a concurrent settlement, reread and retry
        }
    }
}
