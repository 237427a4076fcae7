/// Compute the log-base-two of the next power of two: 8 -> 3, 9 -> 4.
///
pub fn ceil_log2(x: usize) -> usize {
    let mut n = 0;
    while 1 << n < x {
        n += 1
    }
    n
}

/// Encode a value as a MessagePack buffer.
///
pub fn encode<T: serde::Serialize>(value: &T) -> crate::Result<Vec<u8>> {
    Ok(rmp_serde::encode::to_vec(value)?)
}

/// Decode a MessagePack buffer.
///
pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> crate::Result<T> {
    Ok(rmp_serde::decode::from_slice(bytes)?)
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::ceil_log2;

    #[test]
    fn ceil_log2_rounds_up() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(8), 3);
        assert_eq!(ceil_log2(9), 4);
    }
}
