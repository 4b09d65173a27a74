//! Tool records, the reserved-date cache and custody tracking

use crate::booking::{DateRange, TimeStamp};
use crate::error::LendingError;
use crate::geo::LatLng;
use crate::utils::new_tool_id;
use chrono::Utc;

/// One blocked range in the reserved-dates cache, tagged with the accepted
/// booking that owns it so it can be released later.
#[derive(minicbor::Encode, minicbor::Decode, Debug, PartialEq, Clone)]
pub struct ReservedRange {
    #[n(0)]
    pub booking_id: String,
    #[n(1)]
    pub dates: DateRange,
}

/// Append-only record of a nomadic tool changing hands.
#[derive(minicbor::Encode, minicbor::Decode, Debug, PartialEq, Clone)]
pub struct CustodyEntry {
    #[n(0)]
    pub user_id: String,
    #[n(1)]
    pub booking_id: String,
    #[n(2)]
    pub picked_at: TimeStamp<Utc>,
    #[n(3)]
    pub location: LatLng,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, PartialEq, Clone)]
pub struct Tool {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub owner_id: String,
    #[n(2)]
    pub title: String,
    #[n(3)]
    pub daily_cost: u64,
    #[n(4)]
    pub rating: u8, // rounded mean of received scores, 0..=5
    #[n(5)]
    pub is_nomadic: bool,
    #[n(6)]
    pub location: LatLng,
    #[n(7)]
    pub actual_user_id: String, // who physically holds the tool
    #[n(8)]
    pub reserved_dates: Vec<ReservedRange>,
    #[n(9)]
    pub custody_history: Vec<CustodyEntry>,
}

impl Tool {
    pub fn new(
        owner_id: &str,
        title: &str,
        daily_cost: u64,
        location: LatLng,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            id: new_tool_id()?,
            owner_id: owner_id.to_string(),
            title: title.to_string(),
            daily_cost,
            rating: 0,
            is_nomadic: false,
            location,
            actual_user_id: owner_id.to_string(),
            reserved_dates: Vec::new(),
            custody_history: Vec::new(),
        })
    }

    pub fn nomadic(mut self) -> Self {
        self.is_nomadic = true;
        self
    }
}

/// Narrow interface over the `tools` tree. Custody fields are only ever
/// mutated through [`ToolStore::record_pickup`].
pub struct ToolStore {
    tree: sled::Tree,
}

impl ToolStore {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    pub fn insert(&self, tool: &Tool) -> anyhow::Result<()> {
        self.tree
            .insert(tool.id.as_bytes(), minicbor::to_vec(tool)?)?;
        Ok(())
    }

    pub fn get(&self, tool_id: &str) -> anyhow::Result<Tool> {
        let bytes = self
            .tree
            .get(tool_id.as_bytes())?
            .ok_or_else(|| LendingError::NotFound(tool_id.to_string()))?;

        Ok(minicbor::decode(bytes.as_ref())?)
    }

    /// Read-modify-write of a single tool document.
    pub fn update<F: FnOnce(&mut Tool)>(&self, tool_id: &str, apply: F) -> anyhow::Result<Tool> {
        let mut tool = self.get(tool_id)?;
        apply(&mut tool);
        self.insert(&tool)?;
        Ok(tool)
    }

    /// Add an accepted booking's range to the reserved-dates cache.
    pub fn push_reserved(
        &self,
        tool_id: &str,
        booking_id: &str,
        dates: DateRange,
    ) -> anyhow::Result<()> {
        self.update(tool_id, |tool| {
            tool.reserved_dates.push(ReservedRange {
                booking_id: booking_id.to_string(),
                dates,
            });
        })?;
        Ok(())
    }

    /// Release the range owned by `booking_id` from the cache.
    pub fn pull_reserved(&self, tool_id: &str, booking_id: &str) -> anyhow::Result<()> {
        self.update(tool_id, |tool| {
            tool.reserved_dates
                .retain(|range| range.booking_id != booking_id);
        })?;
        Ok(())
    }

    /// Relocate a nomadic tool to its new holder and append the history entry.
    pub fn record_pickup(
        &self,
        tool_id: &str,
        holder_id: &str,
        holder_location: LatLng,
        booking_id: &str,
    ) -> anyhow::Result<Tool> {
        let tool = self.get(tool_id)?;
        if !tool.is_nomadic {
            return Err(anyhow::Error::msg(
                "custody tracking only applies to nomadic tools",
            ));
        }

        self.update(tool_id, |tool| {
            tool.actual_user_id = holder_id.to_string();
            tool.location = holder_location;
            tool.custody_history.push(CustodyEntry {
                user_id: holder_id.to_string(),
                booking_id: booking_id.to_string(),
                picked_at: TimeStamp::new(),
                location: holder_location,
            });
        })
    }

    pub fn set_rating(&self, tool_id: &str, rating: u8) -> anyhow::Result<()> {
        self.update(tool_id, |tool| tool.rating = rating)?;
        Ok(())
    }
}
