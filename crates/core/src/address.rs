//! Harmony addresses: one 20-byte identity, two textual forms.
//!
//! The native form is bech32 with the `one` human-readable part
//! (`one1…`), the alternate form is Ethereum-style hex (`0x…`). Only the raw
//! bytes are stored; both strings are derived on demand.

use crate::error::{LoadError, LoadResult};
use bech32::{Bech32, Hrp};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const ONE_HRP: &str = "one";

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(alloy_primitives::Address);

impl Address {
    pub const ZERO: Self = Self(alloy_primitives::Address::ZERO);

    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(alloy_primitives::Address::new(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> LoadResult<Self> {
        if bytes.len() != 20 {
            return Err(LoadError::Decode(format!(
                "address must be 20 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(alloy_primitives::Address::from_slice(bytes)))
    }

    /// Parses either a `one1…` or a `0x…` address.
    pub fn parse(s: &str) -> LoadResult<Self> {
        if let Some(hex_part) = s.strip_prefix("0x") {
            let bytes = hex::decode(hex_part)
                .map_err(|e| LoadError::Decode(format!("invalid hex address {s:?}: {e}")))?;
            return Self::from_slice(&bytes);
        }
        if s.starts_with("one1") {
            let (hrp, bytes) = bech32::decode(s)
                .map_err(|e| LoadError::Decode(format!("invalid bech32 address {s:?}: {e}")))?;
            if hrp.as_str() != ONE_HRP {
                return Err(LoadError::Decode(format!(
                    "unexpected address prefix {:?} in {s:?}",
                    hrp.as_str()
                )));
            }
            return Self::from_slice(&bytes);
        }
        Err(LoadError::Decode(format!(
            "address {s:?} is neither one1… nor 0x…"
        )))
    }

    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn inner(&self) -> alloy_primitives::Address {
        self.0
    }

    /// Lower-case `0x…` form.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0.as_slice()))
    }

    /// Native `one1…` form.
    pub fn to_one(&self) -> String {
        let hrp = Hrp::parse_unchecked(ONE_HRP);
        // Encoding 20 bytes under a fixed, valid HRP cannot exceed the bech32 length limit.
        bech32::encode::<Bech32>(hrp, self.0.as_slice()).unwrap_or_default()
    }
}

impl From<alloy_primitives::Address> for Address {
    fn from(inner: alloy_primitives::Address) -> Self {
        Self(inner)
    }
}

impl FromStr for Address {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_one())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
