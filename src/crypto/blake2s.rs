//! BLAKE2s primitives for MAC and cookie computation
//!
//! MAC1 and MAC2 are 16-byte keyed BLAKE2s outputs; key derivation is
//! plain BLAKE2s-256 over a label and an identity value.

use blake2::{
    digest::{consts::U16, FixedOutput, Mac as MacTrait},
    Blake2s256, Blake2sMac, Digest,
};

/// Length of BLAKE2s-256 hash output
pub const HASH_LEN: usize = 32;

/// Length of BLAKE2s MAC output (16 bytes for WireGuard)
pub const MAC_LEN: usize = 16;

/// BLAKE2s-256 hash of two concatenated inputs: HASH(a || b)
///
/// Used to derive the MAC1 and cookie keys from a label and an
/// identity input.
pub fn hash_two(a: &[u8], b: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, a);
    Digest::update(&mut hasher, b);
    hasher.finalize().into()
}

/// BLAKE2s keyed MAC (16 bytes output) with 32-byte key
///
/// Used for MAC1 over the handshake message body.
pub fn mac(key: &[u8; HASH_LEN], data: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = Blake2sMac::<U16>::new_from_slice(key).expect("valid key length");
    MacTrait::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// BLAKE2s keyed MAC (16 bytes output) with 32-byte key over a || b
///
/// Used for cookie manufacture: keyed by the rotating secret over the
/// source address bytes followed by the port.
pub fn mac_two(key: &[u8; HASH_LEN], a: &[u8], b: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = Blake2sMac::<U16>::new_from_slice(key).expect("valid key length");
    MacTrait::update(&mut mac, a);
    MacTrait::update(&mut mac, b);
    mac.finalize_fixed().into()
}

/// BLAKE2s keyed MAC (16 bytes output) with 16-byte key over a || b
///
/// Used for MAC2: keyed by the cookie over the message body followed
/// by MAC1.
pub fn mac_with_cookie(key: &[u8; MAC_LEN], a: &[u8], b: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = Blake2sMac::<U16>::new_from_slice(key).expect("valid key length");
    MacTrait::update(&mut mac, a);
    MacTrait::update(&mut mac, b);
    mac.finalize_fixed().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_two_matches_concatenation() {
        let a = b"hello";
        let b = b"world";

        let result1 = hash_two(a, b);

        let mut hasher = Blake2s256::new();
        Digest::update(&mut hasher, b"helloworld".as_slice());
        let result2: [u8; HASH_LEN] = hasher.finalize().into();

        assert_eq!(result1, result2);
    }

    #[test]
    fn test_mac_length_and_key_sensitivity() {
        let key_a = [0u8; 32];
        let key_b = [1u8; 32];
        let data = b"test data";

        let mac_a = mac(&key_a, data);
        let mac_b = mac(&key_b, data);

        assert_eq!(mac_a.len(), 16);
        assert_ne!(mac_a, mac_b);
    }

    #[test]
    fn test_mac_two_matches_single_update() {
        let key = [7u8; 32];
        let mac_split = mac_two(&key, b"abc", b"def");
        let mac_joined = mac(&key, b"abcdef");
        assert_eq!(mac_split, mac_joined);
    }

    #[test]
    fn test_mac_with_cookie_order_matters() {
        let cookie = [9u8; 16];
        let forward = mac_with_cookie(&cookie, b"message", b"mac1tag");
        let reversed = mac_with_cookie(&cookie, b"mac1tag", b"message");
        assert_ne!(forward, reversed);
    }
}
