//! Byte shuffle filter

use bytes::Bytes;

/// Invert the byte shuffle filter.
///
/// A shuffled buffer of N elements of M bytes stores byte 0 of every element, then byte 1 of
/// every element, and so on.
///
/// # Arguments
///
/// * `data`: `Bytes` to deshuffle. The length must be a multiple of `element_size`.
/// * `element_size`: Size of each element in bytes.
pub fn deshuffle(data: &Bytes, element_size: usize) -> Bytes {
    let num_elements = data.len() / element_size;
    let mut result = vec![0_u8; data.len()];
    for (i, element) in result.chunks_exact_mut(element_size).enumerate() {
        for (j, byte) in element.iter_mut().enumerate() {
            *byte = data[j * num_elements + i];
        }
    }
    result.into()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn test_deshuffle_2() {
        let shuffled = [0, 2, 4, 6, 1, 3, 5, 7];
        let result = deshuffle(&Bytes::copy_from_slice(&shuffled), 2);
        assert_eq!([0, 1, 2, 3, 4, 5, 6, 7].as_ref(), result);
    }

    #[test]
    fn test_deshuffle_8() {
        let shuffled = [0, 8, 1, 9, 2, 10, 3, 11, 4, 12, 5, 13, 6, 14, 7, 15];
        let result = deshuffle(&Bytes::copy_from_slice(&shuffled), 8);
        let expected: Vec<u8> = (0..16).collect();
        assert_eq!(expected.as_slice(), result);
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;

    /// Apply the byte shuffle filter.
    pub(crate) fn shuffle(data: &Bytes, element_size: usize) -> Bytes {
        let mut result = Vec::with_capacity(data.len());
        for i in 0..element_size {
            result.extend(data.iter().skip(i).step_by(element_size));
        }
        result.into()
    }

    #[test]
    fn test_shuffle_roundtrip() {
        let data = Bytes::from((0..24).collect::<Vec<u8>>());
        let shuffled = shuffle(&data, 4);
        assert_eq!([0, 4, 8, 12, 16, 20], shuffled[..6]);
        assert_eq!(data, deshuffle(&shuffled, 4));
    }
}
