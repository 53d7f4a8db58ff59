//! Filter implementations.

pub mod shuffle;

use crate::error::PadoccError;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Filter as written in a `.zarray` `filters` entry.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "id", rename_all = "lowercase")]
pub enum Filter {
    /// Byte shuffle
    Shuffle { elementsize: usize },
}

impl Filter {
    /// Parse a `filters` entry.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, PadoccError> {
        serde_json::from_value(value.clone()).map_err(|_| PadoccError::UnsupportedOperation {
            operation: format!("filter {}", value),
        })
    }
}

/// Decodes some bytes using the specified filter and returns the result.
///
/// # Arguments
///
/// * `filter`: Filter algorithm
/// * `data`: Filtered data [Bytes]
pub fn decode(filter: &Filter, data: &Bytes) -> Result<Bytes, PadoccError> {
    match filter {
        Filter::Shuffle { elementsize } => {
            if *elementsize == 0 || data.len() % elementsize != 0 {
                return Err(PadoccError::ChunkData {
                    reason: format!(
                        "{} bytes cannot be deshuffled with element size {}",
                        data.len(),
                        elementsize
                    ),
                });
            }
            Ok(shuffle::deshuffle(data, *elementsize))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters;

    use serde_json::json;

    #[test]
    fn test_decode_shuffle() {
        let data = [1, 2, 3, 4, 5, 6, 7, 8];
        let bytes = Bytes::copy_from_slice(&data);
        let shuffled = filters::shuffle::test_utils::shuffle(&bytes, 4);
        let filter = Filter::Shuffle { elementsize: 4 };
        let result = decode(&filter, &shuffled).unwrap();
        assert_eq!(data.as_ref(), result);
    }

    #[test]
    fn test_decode_shuffle_bad_length() {
        let bytes = Bytes::from_static(&[1, 2, 3]);
        let filter = Filter::Shuffle { elementsize: 2 };
        assert!(matches!(
            decode(&filter, &bytes),
            Err(PadoccError::ChunkData { .. })
        ));
    }

    #[test]
    fn test_from_value() {
        assert_eq!(
            Filter::Shuffle { elementsize: 8 },
            Filter::from_value(&json!({"id": "shuffle", "elementsize": 8})).unwrap()
        );
        assert!(Filter::from_value(&json!({"id": "delta"})).is_err());
    }
}
