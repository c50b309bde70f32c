/// Masks or unmasks `buf` in place with the 4-byte masking key.
///
/// `out[i] = in[i] ^ key[i % 4]`, so applying the same key twice yields the original bytes.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let key = u32::from_ne_bytes(mask);

    let mut words = buf.chunks_exact_mut(4);
    for word in &mut words {
        let masked = u32::from_ne_bytes([word[0], word[1], word[2], word[3]]) ^ key;
        word.copy_from_slice(&masked.to_ne_bytes());
    }

    // the tail starts at a multiple of 4, so the key index restarts at 0
    apply_mask_bytewise(words.into_remainder(), mask);
}

#[inline]
fn apply_mask_bytewise(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc_example() {
        // RFC 6455 section 5.7, masked "Hello"
        let mut payload = [0x7f, 0x9f, 0x4d, 0x51, 0x58];
        apply_mask(&mut payload, [0x37, 0xfa, 0x21, 0x3d]);
        assert_eq!(&payload, b"Hello");
    }

    #[test]
    fn test_mask_twice_is_identity() {
        let mask = [0x6d, 0xb6, 0xb2, 0x80];
        for len in 0..67 {
            let original: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let mut data = original.clone();
            apply_mask(&mut data, mask);
            if len > 0 {
                assert_ne!(data, original);
            }
            apply_mask(&mut data, mask);
            assert_eq!(data, original, "length {len}");
        }
    }

    #[test]
    fn test_words_match_bytewise() {
        let mask = [0x01, 0x23, 0x45, 0x67];
        for len in 0..33 {
            let mut fast: Vec<u8> = (0..len as u8).collect();
            let mut slow = fast.clone();
            apply_mask(&mut fast, mask);
            apply_mask_bytewise(&mut slow, mask);
            assert_eq!(fast, slow, "length {len}");
        }
    }

    #[test]
    fn test_unaligned_slice() {
        let mask = [0xaa, 0xbb, 0xcc, 0xdd];
        let mut data = vec![0u8; 13];
        apply_mask(&mut data[1..], mask);
        assert_eq!(data[0], 0);
        assert_eq!(&data[1..5], &mask);
        assert_eq!(&data[9..13], &mask);
    }

    #[test]
    fn test_zero_mask_is_noop() {
        let mut data = b"unchanged".to_vec();
        apply_mask(&mut data, [0; 4]);
        assert_eq!(&data, b"unchanged");
    }
}
