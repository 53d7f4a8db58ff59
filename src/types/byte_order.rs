use serde::{Deserialize, Serialize};

#[cfg(target_endian = "big")]
pub const NATIVE_BYTE_ORDER: ByteOrder = ByteOrder::Big;

#[cfg(target_endian = "little")]
pub const NATIVE_BYTE_ORDER: ByteOrder = ByteOrder::Little;

#[cfg(target_endian = "big")]
pub const NON_NATIVE_BYTE_ORDER: ByteOrder = ByteOrder::Little;

#[cfg(target_endian = "little")]
pub const NON_NATIVE_BYTE_ORDER: ByteOrder = ByteOrder::Big;

/// Byte order / endianness.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    /// Big Endian
    Big,
    /// Little Endian
    Little,
}

impl ByteOrder {
    /// Parse a zarr byte order marker (`<`, `>`, `|`).
    ///
    /// `|` (not applicable) yields `None`.
    pub fn from_marker(marker: char) -> Option<Option<Self>> {
        match marker {
            '<' => Some(Some(ByteOrder::Little)),
            '>' => Some(Some(ByteOrder::Big)),
            '|' => Some(None),
            _ => None,
        }
    }

    /// Zarr marker for this byte order.
    pub fn marker(&self) -> char {
        match self {
            ByteOrder::Little => '<',
            ByteOrder::Big => '>',
        }
    }
}
