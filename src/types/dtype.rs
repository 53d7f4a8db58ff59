//! Zarr v2 data type strings, e.g. `<f8`, `>i2`, `|S10`.

use crate::error::PadoccError;
use crate::types::ByteOrder;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Kind of element stored in an array.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DataKind {
    /// `b`
    Bool,
    /// `i`
    Int,
    /// `u`
    UInt,
    /// `f`
    Float,
    /// `S`, fixed-width bytes
    Bytes,
    /// `U`, fixed-width UCS4 text
    Unicode,
}

impl DataKind {
    fn code(&self) -> char {
        match self {
            DataKind::Bool => 'b',
            DataKind::Int => 'i',
            DataKind::UInt => 'u',
            DataKind::Float => 'f',
            DataKind::Bytes => 'S',
            DataKind::Unicode => 'U',
        }
    }
}

/// Parsed zarr data type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DType {
    /// Byte order, `None` when not applicable
    pub order: Option<ByteOrder>,
    pub kind: DataKind,
    /// Width in characters for text kinds, bytes otherwise
    pub width: usize,
}

impl DType {
    /// Little endian 64 bit float.
    pub const F8: DType = DType {
        order: Some(ByteOrder::Little),
        kind: DataKind::Float,
        width: 8,
    };

    /// Little endian 64 bit signed integer.
    pub const I8: DType = DType {
        order: Some(ByteOrder::Little),
        kind: DataKind::Int,
        width: 8,
    };

    /// Size of one element in bytes.
    pub fn itemsize(&self) -> usize {
        match self.kind {
            DataKind::Unicode => self.width * 4,
            _ => self.width,
        }
    }

    /// Whether elements are numbers that can be summed.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self.kind,
            DataKind::Int | DataKind::UInt | DataKind::Float | DataKind::Bool
        )
    }

    /// Whether the element type can hold NaN.
    pub fn is_float(&self) -> bool {
        self.kind == DataKind::Float
    }
}

impl FromStr for DType {
    type Err = PadoccError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PadoccError::InvalidConfig(format!("unsupported dtype {}", s));
        let mut chars = s.chars();
        let order = chars
            .next()
            .and_then(ByteOrder::from_marker)
            .ok_or_else(invalid)?;
        let kind = match chars.next().ok_or_else(invalid)? {
            'b' => DataKind::Bool,
            'i' => DataKind::Int,
            'u' => DataKind::UInt,
            'f' => DataKind::Float,
            'S' => DataKind::Bytes,
            'U' => DataKind::Unicode,
            _ => return Err(invalid()),
        };
        let width: usize = chars.as_str().parse().map_err(|_| invalid())?;
        let valid = match kind {
            DataKind::Bool => width == 1,
            DataKind::Int | DataKind::UInt => matches!(width, 1 | 2 | 4 | 8),
            DataKind::Float => matches!(width, 4 | 8),
            DataKind::Bytes | DataKind::Unicode => width > 0,
        };
        if !valid {
            return Err(invalid());
        }
        Ok(DType { order, kind, width })
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = self.order.map(|o| o.marker()).unwrap_or('|');
        write!(f, "{}{}{}", marker, self.kind.code(), self.width)
    }
}

impl Serialize for DType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_test::{assert_tokens, Token};

    #[test]
    fn parse_numeric() {
        let dtype: DType = "<f8".parse().unwrap();
        assert_eq!(DType::F8, dtype);
        assert!(dtype.is_numeric());
        let dtype: DType = ">i2".parse().unwrap();
        assert_eq!(Some(ByteOrder::Big), dtype.order);
        assert_eq!(2, dtype.itemsize());
        let dtype: DType = "|u1".parse().unwrap();
        assert_eq!(None, dtype.order);
    }

    #[test]
    fn parse_text() {
        let dtype: DType = "|S10".parse().unwrap();
        assert_eq!(DataKind::Bytes, dtype.kind);
        assert!(!dtype.is_numeric());
        let dtype: DType = "<U5".parse().unwrap();
        assert_eq!(20, dtype.itemsize());
    }

    #[test]
    fn parse_invalid() {
        assert!("f8".parse::<DType>().is_err());
        assert!("<f3".parse::<DType>().is_err());
        assert!("<x8".parse::<DType>().is_err());
        assert!("".parse::<DType>().is_err());
    }

    #[test]
    fn serde_tokens() {
        assert_tokens(&DType::I8, &[Token::Str("<i8")]);
    }
}
