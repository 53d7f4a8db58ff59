//! Conversion between raw chunk bytes and [ndarray] values.

use crate::error::PadoccError;
use crate::types::byte_order::NATIVE_BYTE_ORDER;
use crate::types::{DType, DataKind};

use ndarray::prelude::*;
use ndarray::ShapeBuilder;
use num_traits::{NumCast, ToPrimitive};
use serde::{Deserialize, Serialize};
use zerocopy::AsBytes;

/// Memory layout of a chunk.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum Order {
    /// Row major (C) order
    #[default]
    C,
    /// Column major (Fortran) order
    F,
}

/// Convert from bytes to `&[T]`.
///
/// Zerocopy provides a mechanism for converting between types.
/// Correct alignment of the data is necessary.
///
/// # Arguments
///
/// * `data`: Bytes containing data to convert.
fn from_bytes<T: zerocopy::FromBytes>(data: &[u8]) -> Result<&[T], PadoccError> {
    let layout = zerocopy::LayoutVerified::<_, [T]>::new_slice(data).ok_or(
        PadoccError::FromBytes {
            type_name: std::any::type_name::<T>(),
        },
    )?;
    Ok(layout.into_slice())
}

/// Copy bytes into an 8-byte aligned buffer, reversing each element when `swap` is set.
fn aligned(data: &[u8], itemsize: usize, swap: bool) -> Vec<u8> {
    let mut buf = maligned::align_first::<u8, maligned::A8>(data.len());
    buf.extend_from_slice(data);
    if swap && itemsize > 1 {
        for element in buf.chunks_exact_mut(itemsize) {
            element.reverse();
        }
    }
    buf
}

fn needs_swap(dtype: &DType) -> bool {
    matches!(dtype.order, Some(order) if order != NATIVE_BYTE_ORDER)
}

fn to_f64<T>(data: &[u8]) -> Result<Vec<f64>, PadoccError>
where
    T: zerocopy::FromBytes + ToPrimitive,
{
    Ok(from_bytes::<T>(data)?
        .iter()
        .map(|v| v.to_f64().unwrap_or(f64::NAN))
        .collect())
}

/// Decode numeric chunk bytes into `f64` values.
///
/// # Arguments
///
/// * `dtype`: Element type of the chunk
/// * `data`: Raw (decompressed and unfiltered) chunk bytes
pub fn decode_numeric(dtype: &DType, data: &[u8]) -> Result<Vec<f64>, PadoccError> {
    let itemsize = dtype.itemsize();
    if data.len() % itemsize != 0 {
        return Err(PadoccError::ChunkData {
            reason: format!("{} bytes is not a multiple of {}", data.len(), itemsize),
        });
    }
    let buf = aligned(data, itemsize, needs_swap(dtype));
    match (dtype.kind, dtype.width) {
        (DataKind::Float, 4) => to_f64::<f32>(&buf),
        (DataKind::Float, 8) => to_f64::<f64>(&buf),
        (DataKind::Int, 1) => to_f64::<i8>(&buf),
        (DataKind::Int, 2) => to_f64::<i16>(&buf),
        (DataKind::Int, 4) => to_f64::<i32>(&buf),
        (DataKind::Int, 8) => to_f64::<i64>(&buf),
        (DataKind::UInt, 1) | (DataKind::Bool, 1) => to_f64::<u8>(&buf),
        (DataKind::UInt, 2) => to_f64::<u16>(&buf),
        (DataKind::UInt, 4) => to_f64::<u32>(&buf),
        (DataKind::UInt, 8) => to_f64::<u64>(&buf),
        _ => Err(PadoccError::UnsupportedOperation {
            operation: format!("numeric decoding of {}", dtype),
        }),
    }
}

/// Decode fixed-width text chunk bytes.
///
/// Trailing NUL padding is removed from each element.
pub fn decode_text(dtype: &DType, data: &[u8]) -> Result<Vec<String>, PadoccError> {
    let itemsize = dtype.itemsize();
    if itemsize == 0 || data.len() % itemsize != 0 {
        return Err(PadoccError::ChunkData {
            reason: format!("{} bytes is not a multiple of {}", data.len(), itemsize),
        });
    }
    match dtype.kind {
        DataKind::Bytes => Ok(data
            .chunks_exact(itemsize)
            .map(|element| {
                let end = element.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
                String::from_utf8_lossy(&element[..end]).into_owned()
            })
            .collect()),
        DataKind::Unicode => {
            let buf = aligned(data, 4, needs_swap(dtype));
            let points = from_bytes::<u32>(&buf)?;
            Ok(points
                .chunks_exact(dtype.width)
                .map(|element| {
                    element
                        .iter()
                        .take_while(|p| **p != 0)
                        .filter_map(|p| char::from_u32(*p))
                        .collect()
                })
                .collect())
        }
        _ => Err(PadoccError::UnsupportedOperation {
            operation: format!("text decoding of {}", dtype),
        }),
    }
}

fn from_f64<T>(values: &[f64]) -> Result<Vec<u8>, PadoccError>
where
    T: zerocopy::AsBytes + NumCast,
{
    let cast = values
        .iter()
        .map(|v| {
            <T as NumCast>::from(*v).ok_or(PadoccError::FromBytes {
                type_name: std::any::type_name::<T>(),
            })
        })
        .collect::<Result<Vec<T>, _>>()?;
    Ok(cast.as_slice().as_bytes().to_vec())
}

/// Encode `f64` values as chunk bytes of the given numeric type.
pub fn encode_numeric(dtype: &DType, values: &[f64]) -> Result<Vec<u8>, PadoccError> {
    let mut data = match (dtype.kind, dtype.width) {
        (DataKind::Float, 4) => from_f64::<f32>(values)?,
        (DataKind::Float, 8) => from_f64::<f64>(values)?,
        (DataKind::Int, 1) => from_f64::<i8>(values)?,
        (DataKind::Int, 2) => from_f64::<i16>(values)?,
        (DataKind::Int, 4) => from_f64::<i32>(values)?,
        (DataKind::Int, 8) => from_f64::<i64>(values)?,
        (DataKind::UInt, 1) | (DataKind::Bool, 1) => from_f64::<u8>(values)?,
        (DataKind::UInt, 2) => from_f64::<u16>(values)?,
        (DataKind::UInt, 4) => from_f64::<u32>(values)?,
        (DataKind::UInt, 8) => from_f64::<u64>(values)?,
        _ => {
            return Err(PadoccError::UnsupportedOperation {
                operation: format!("numeric encoding of {}", dtype),
            })
        }
    };
    if needs_swap(dtype) {
        for element in data.chunks_exact_mut(dtype.itemsize()) {
            element.reverse();
        }
    }
    Ok(data)
}

/// Encode text values as fixed-width chunk bytes.
pub fn encode_text(dtype: &DType, values: &[String]) -> Result<Vec<u8>, PadoccError> {
    let mut data = Vec::with_capacity(values.len() * dtype.itemsize());
    for value in values {
        match dtype.kind {
            DataKind::Bytes => {
                let mut element = value.as_bytes().to_vec();
                element.resize(dtype.width, 0);
                data.extend(element);
            }
            DataKind::Unicode => {
                let mut points: Vec<u32> = value.chars().map(<u32 as From<char>>::from).collect();
                points.resize(dtype.width, 0);
                for point in points {
                    match dtype.order {
                        Some(crate::types::ByteOrder::Big) => data.extend(point.to_be_bytes()),
                        _ => data.extend(point.to_le_bytes()),
                    }
                }
            }
            _ => {
                return Err(PadoccError::UnsupportedOperation {
                    operation: format!("text encoding of {}", dtype),
                })
            }
        }
    }
    Ok(data)
}

/// Build an owned, row-major array from chunk values.
///
/// # Arguments
///
/// * `shape`: Chunk shape
/// * `order`: Memory layout of `values`
/// * `values`: Decoded chunk values
pub fn build_array<T: Clone>(
    shape: &[usize],
    order: Order,
    values: Vec<T>,
) -> Result<ArrayD<T>, PadoccError> {
    let shape = IxDyn(shape);
    let array = match order {
        Order::C => ArrayD::from_shape_vec(shape, values)?,
        Order::F => ArrayD::from_shape_vec(shape.f(), values)?,
    };
    Ok(array.as_standard_layout().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::types::ByteOrder;

    #[test]
    fn from_bytes_u32() {
        let buf = aligned(&[1, 2, 3, 4], 4, false);
        assert_eq!(
            [u32::from_ne_bytes([1, 2, 3, 4])],
            from_bytes::<u32>(&buf).unwrap()
        );
    }

    #[test]
    fn from_bytes_misaligned_length() {
        let buf = aligned(&[1, 2, 3], 1, false);
        assert!(matches!(
            from_bytes::<u16>(&buf),
            Err(PadoccError::FromBytes { .. })
        ));
    }

    #[test]
    fn decode_big_endian() {
        let dtype: DType = ">i2".parse().unwrap();
        assert_eq!(vec![1.0, 258.0], decode_numeric(&dtype, &[0, 1, 1, 2]).unwrap());
        let dtype: DType = ">f4".parse().unwrap();
        assert_eq!(vec![1.5], decode_numeric(&dtype, &1.5_f32.to_be_bytes()).unwrap());
    }

    #[test]
    fn decode_little_endian() {
        let dtype: DType = "<f8".parse().unwrap();
        let mut data = Vec::new();
        data.extend(2.5_f64.to_le_bytes());
        data.extend((-1.0_f64).to_le_bytes());
        assert_eq!(vec![2.5, -1.0], decode_numeric(&dtype, &data).unwrap());
        assert!(decode_numeric(&dtype, &data[..7]).is_err());
    }

    #[test]
    fn encode_roundtrip_non_native() {
        let dtype = DType {
            order: Some(ByteOrder::Big),
            kind: DataKind::Int,
            width: 4,
        };
        let data = encode_numeric(&dtype, &[1.0, -2.0]).unwrap();
        assert_eq!(vec![0, 0, 0, 1, 255, 255, 255, 254], data);
        assert_eq!(vec![1.0, -2.0], decode_numeric(&dtype, &data).unwrap());
        assert!(encode_numeric(&dtype, &[f64::NAN]).is_err());
    }

    #[test]
    fn text_values() {
        let dtype: DType = "|S4".parse().unwrap();
        let values = decode_text(&dtype, b"ab\0\0abcd").unwrap();
        assert_eq!(vec!["ab".to_string(), "abcd".to_string()], values);
        assert_eq!(b"ab\0\0abcd".to_vec(), encode_text(&dtype, &values).unwrap());
        let dtype: DType = "<U2".parse().unwrap();
        let data = encode_text(&dtype, &["é".to_string()]).unwrap();
        assert_eq!(8, data.len());
        assert_eq!(vec!["é".to_string()], decode_text(&dtype, &data).unwrap());
    }

    #[test]
    fn fortran_order() {
        let array = build_array(&[2, 2], Order::F, vec![1, 2, 3, 4]).unwrap();
        assert_eq!(array, array![[1, 3], [2, 4]].into_dyn());
        let array = build_array(&[2, 2], Order::C, vec![1, 2, 3, 4]).unwrap();
        assert_eq!(array, array![[1, 2], [3, 4]].into_dyn());
        assert!(build_array(&[3], Order::C, vec![1]).is_err());
    }
}
