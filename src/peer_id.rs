//! Peer identity generation (spec §3): `-PC0001-` followed by 12 decimal
//! digits drawn from a cryptographically adequate RNG.

use rand::Rng;

const PREFIX: &[u8; 8] = b"-PC0001-";

pub fn generate() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(PREFIX);
    let mut rng = rand::thread_rng();
    for slot in &mut id[8..20] {
        *slot = b'0' + rng.gen_range(0..10);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_expected_prefix_and_length() {
        let id = generate();
        assert_eq!(&id[..8], PREFIX);
        assert_eq!(id.len(), 20);
    }

    #[test]
    fn remaining_bytes_are_decimal_digits() {
        let id = generate();
        for &b in &id[8..] {
            assert!(b.is_ascii_digit(), "byte {b} is not a decimal digit");
        }
    }

    #[test]
    fn two_calls_are_very_unlikely_to_collide() {
        assert_ne!(generate(), generate());
    }
}
