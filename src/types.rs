//! Core ledger and collection types

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use alloy_primitives::{Address, BlockNumber, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Account whose holdings are being synchronized.
pub type Subject = Address;

/// Set of currently-held item identifiers. Ordered so reports are stable.
pub type HoldingSet = BTreeSet<ItemId>;

/// ERC-721 token id.
///
/// Ledger-native ids are 256-bit, so they are kept as `U256` in memory and
/// rendered as decimal strings wherever they are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ItemId(pub U256);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid item id: {0}")]
pub struct ParseItemIdError(pub String);

impl ItemId {
    pub fn as_u256(&self) -> U256 {
        self.0
    }
}

impl From<u64> for ItemId {
    fn from(value: u64) -> Self {
        Self(U256::from(value))
    }
}

impl From<U256> for ItemId {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = ParseItemIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ParseItemIdError(s.to_string()));
        }
        trimmed
            .parse::<U256>()
            .map(Self)
            .map_err(|_| ParseItemIdError(s.to_string()))
    }
}

impl From<ItemId> for String {
    fn from(id: ItemId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for ItemId {
    type Error = ParseItemIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Which side of a transfer the subject is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferDirection {
    /// `to == subject`
    Incoming,
    /// `from == subject`
    Outgoing,
}

/// A single `Transfer(from, to, tokenId)` log entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferEvent {
    pub from: Address,
    pub to: Address,
    pub item_id: ItemId,
    pub block: BlockNumber,
}

impl TransferEvent {
    /// A transfer from the zero address is a mint.
    pub fn is_mint(&self) -> bool {
        self.from == Address::ZERO
    }
}

/// Card rarity tiers as encoded by the card contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Rarity {
    Common,
    Uncommon,
    Rare,
    Epic,
    Legendary,
}

impl TryFrom<u8> for Rarity {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Rarity::Common),
            1 => Ok(Rarity::Uncommon),
            2 => Ok(Rarity::Rare),
            3 => Ok(Rarity::Epic),
            4 => Ok(Rarity::Legendary),
            other => Err(format!("unknown rarity {}", other)),
        }
    }
}

impl From<Rarity> for u8 {
    fn from(rarity: Rarity) -> Self {
        rarity as u8
    }
}

impl fmt::Display for Rarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Rarity::Common => "Common",
            Rarity::Uncommon => "Uncommon",
            Rarity::Rare => "Rare",
            Rarity::Epic => "Epic",
            Rarity::Legendary => "Legendary",
        };
        f.write_str(name)
    }
}

/// Raw `getCardMetadata` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardMetadata {
    pub player_id: U256,
    pub rarity: u8,
    pub mint_timestamp: u64,
    pub metadata_uri: String,
}

/// Descriptive fields for one held card.
///
/// Immutable once fetched; cached alongside the holding set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDetail {
    pub player_id: String,
    pub player_name: String,
    pub position: String,
    pub team: String,
    pub rarity: Rarity,
    #[serde(default)]
    pub image_url: String,
    pub rating: u32,
    pub mint_timestamp: u64,
    #[serde(default)]
    pub metadata_uri: String,
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
