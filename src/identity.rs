//! Phone-number identities and device identifiers

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Country code (2) + area code (2) + local number (1 or more)
static IDENTITY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{2})(\d{2})(\d+)$").expect("Invalid identity regex"));

/// Provider suffix for individual chats
const USER_SUFFIX: &str = "@c.us";
/// Provider suffix for group chats
const GROUP_SUFFIX: &str = "@g.us";
/// Provider pseudo-sender for status updates
const STATUS_BROADCAST: &str = "status@broadcast";

/// Phone-number identity, the unit the credit ledger meters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub country_code: String,
    pub area_code: String,
    pub local_number: String,
}

impl Identity {
    pub fn new(country_code: &str, area_code: &str, local_number: &str) -> Result<Self> {
        Self::parse(&format!("{}{}{}", country_code, area_code, local_number))
    }

    /// Parse a raw number, stripping formatting and the provider user suffix
    pub fn parse(raw: &str) -> Result<Self> {
        let digits = normalize_number(raw);
        let caps = IDENTITY_PATTERN
            .captures(&digits)
            .ok_or_else(|| Error::InvalidIdentity(raw.to_string()))?;

        Ok(Self {
            country_code: caps[1].to_string(),
            area_code: caps[2].to_string(),
            local_number: caps[3].to_string(),
        })
    }

    /// Parse the sender of an inbound provider message.
    /// Group chats and status broadcasts have no individual identity.
    pub fn from_sender(raw: &str) -> Option<Self> {
        if raw == STATUS_BROADCAST || raw.ends_with(GROUP_SUFFIX) {
            return None;
        }
        Self::parse(raw).ok()
    }

    /// Provider chat address for this identity
    pub fn chat_id(&self) -> String {
        format!("{}{}", self, USER_SUFFIX)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.country_code, self.area_code, self.local_number)
    }
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Strip the provider suffix and every non-digit character
pub fn normalize_number(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_suffix = trimmed.strip_suffix(USER_SUFFIX).unwrap_or(trimmed);
    without_suffix.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Opaque per-browser identifier addressing one session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
