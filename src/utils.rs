//! Identifier construction helpers

use bech32::Bech32m;
use uuid7::uuid7;

pub const BOOKING_HRP: &str = "booking";
pub const TOOL_HRP: &str = "tool";
pub const USER_HRP: &str = "user";

// construct a unique time-ordered id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

pub fn new_booking_id() -> anyhow::Result<String> {
    new_uuid_to_bech32(BOOKING_HRP)
}

pub fn new_tool_id() -> anyhow::Result<String> {
    new_uuid_to_bech32(TOOL_HRP)
}

pub fn new_user_id() -> anyhow::Result<String> {
    new_uuid_to_bech32(USER_HRP)
}
