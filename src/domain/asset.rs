use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::ValidationError;

/// Decimals of the chain's native currency
pub const NATIVE_DECIMALS: u8 = 18;

/// Balance lookup key understood by the chain client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetId {
    Native,
    Token(Address),
}

impl std::fmt::Display for AssetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssetId::Native => write!(f, "native"),
            AssetId::Token(address) => write!(f, "{:?}", address),
        }
    }
}

/// Asset moved by a transfer or sweep leg
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Asset {
    Native {
        #[serde(default = "default_native_symbol")]
        symbol: String,
    },
    Erc20 {
        address: Address,
        symbol: String,
        #[serde(default = "default_token_decimals")]
        decimals: u8,
    },
}

fn default_native_symbol() -> String {
    "ETH".to_string()
}

fn default_token_decimals() -> u8 {
    18
}

impl Default for Asset {
    fn default() -> Self {
        Asset::Native {
            symbol: default_native_symbol(),
        }
    }
}

impl Asset {
    pub fn native() -> Self {
        Self::default()
    }

    pub fn erc20(address: Address, symbol: impl Into<String>, decimals: u8) -> Self {
        Asset::Erc20 {
            address,
            symbol: symbol.into(),
            decimals,
        }
    }

    pub fn id(&self) -> AssetId {
        match self {
            Asset::Native { .. } => AssetId::Native,
            Asset::Erc20 { address, .. } => AssetId::Token(*address),
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Asset::Native { symbol } | Asset::Erc20 { symbol, .. } => symbol,
        }
    }

    pub fn decimals(&self) -> u8 {
        match self {
            Asset::Native { .. } => NATIVE_DECIMALS,
            Asset::Erc20 { decimals, .. } => *decimals,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, Asset::Native { .. })
    }
}

/// Parse a 0x-prefixed, 20-byte hex address
pub fn parse_address(field: &str, raw: &str) -> Result<Address, ValidationError> {
    let trimmed = raw.trim();
    let malformed = || ValidationError::MalformedAddress {
        field: field.to_string(),
        value: raw.to_string(),
    };

    let hex_part = trimmed.strip_prefix("0x").ok_or_else(malformed)?;
    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(malformed());
    }

    Address::from_str(trimmed).map_err(|_| malformed())
}
