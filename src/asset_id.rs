//! The 128-bit identifier every texture is fetched by.
use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// Opaque, globally unique asset identifier.
///
/// Displays and parses in the usual `8-4-4-4-12` hex form, so that identifiers can be logged and typed in by hand.
#[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct AssetId(u128);

impl AssetId {
    /// The all-zero identifier, which never names a real asset.
    pub const NULL: AssetId = AssetId(0);

    pub const fn from_u128(value: u128) -> AssetId {
        AssetId(value)
    }

    pub const fn as_u128(self) -> u128 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Hex digits without separators, used for cache file names.
    pub fn to_simple_string(self) -> String {
        Uuid::from_u128(self.0).simple().to_string()
    }
}

impl From<u128> for AssetId {
    fn from(value: u128) -> Self {
        AssetId(value)
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Uuid::from_u128(self.0).hyphenated(), f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid asset id {0:?}")]
pub struct ParseAssetIdError(String);

impl FromStr for AssetId {
    type Err = ParseAssetIdError;

    /// Accepts the hyphenated form and the bare 32 hex digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(|u| AssetId(u.as_u128()))
            .map_err(|_| ParseAssetIdError(s.to_string()))
    }
}
