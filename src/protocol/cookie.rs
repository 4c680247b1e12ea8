//! Cookie handling for WireGuard-style DoS protection
//!
//! When a responder is under load, it answers handshake messages whose
//! MAC2 does not check out with an encrypted cookie instead of doing
//! expensive handshake work. The initiator decrypts the cookie and keys
//! MAC2 of subsequent attempts with it, proving it can receive traffic
//! at its claimed source address.
//!
//! [`CookieMaker`] is the initiator half (one per remote peer);
//! [`CookieChecker`] is the responder half (one per local identity).

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::crypto::{aead, blake2s};
use crate::error::{CookieReplyError, MacError};
use crate::ratelimit::RateLimiters;

/// Label for MAC1 key derivation
pub const LABEL_MAC1: &[u8] = b"mac1----";

/// Label for cookie key derivation
pub const LABEL_COOKIE: &[u8] = b"cookie--";

/// Size of MAC1 and MAC2
pub const MAC_SIZE: usize = blake2s::MAC_LEN;

/// Size of the derived MAC1 and cookie keys
pub const KEY_SIZE: usize = blake2s::HASH_LEN;

/// Size of a plaintext cookie
pub const COOKIE_SIZE: usize = 16;

/// Size of the cookie-reply nonce
pub const NONCE_SIZE: usize = aead::XNONCE_LEN;

/// Size of the responder's rotating cookie secret
pub const SECRET_SIZE: usize = 32;

/// Size of the identity input both keys are derived from
pub const INPUT_SIZE: usize = 32;

/// Size of an encrypted cookie: plaintext cookie plus AEAD tag
pub const ENCRYPTED_SIZE: usize = COOKIE_SIZE + aead::TAG_LEN;

/// How long the responder's cookie secret stays valid
pub const COOKIE_SECRET_MAX_AGE: Duration = Duration::from_secs(120);

/// Margin before secret expiry at which an initiator stops using its
/// cookie, so a MAC2 computed just before rotation is not in flight
/// when the responder rotates.
pub const COOKIE_SECRET_LATENCY: Duration = Duration::from_secs(5);

/// The MAC pair carried at the tail of every handshake message.
///
/// MAC1 proves knowledge of the responder's identity; MAC2 proves the
/// sender holds a fresh cookie. MAC2 is all zeros when no cookie is
/// held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CookieMacs {
    pub mac1: [u8; MAC_SIZE],
    pub mac2: [u8; MAC_SIZE],
}

/// Derive a MAC1 or cookie key: BLAKE2s-256(label || input)
fn precompute_key(label: &[u8], input: &[u8; INPUT_SIZE]) -> [u8; KEY_SIZE] {
    blake2s::hash_two(label, input)
}

struct MakerState {
    cookie: [u8; COOKIE_SIZE],
    cookie_birthdate: Option<Instant>,
    mac1_valid: bool,
    mac1_last: [u8; MAC_SIZE],
}

impl MakerState {
    /// A cookie is used only while it is comfortably younger than the
    /// responder's secret rotation interval.
    fn cookie_fresh(&self) -> bool {
        self.cookie_birthdate
            .is_some_and(|t| t.elapsed() <= COOKIE_SECRET_MAX_AGE - COOKIE_SECRET_LATENCY)
    }
}

/// Initiator-side cookie state for one remote peer.
///
/// Computes the MAC pair for outgoing handshake messages and ingests
/// encrypted cookie replies. Keys are precomputed from the peer's
/// identity at construction and never change.
pub struct CookieMaker {
    mac1_key: [u8; KEY_SIZE],
    cookie_key: [u8; KEY_SIZE],
    state: RwLock<MakerState>,
}

impl CookieMaker {
    /// Create a maker keyed by the remote peer's 32-byte identity input.
    pub fn new(input: &[u8; INPUT_SIZE]) -> Self {
        Self {
            mac1_key: precompute_key(LABEL_MAC1, input),
            cookie_key: precompute_key(LABEL_COOKIE, input),
            state: RwLock::new(MakerState {
                cookie: [0u8; COOKIE_SIZE],
                cookie_birthdate: None,
                mac1_valid: false,
                mac1_last: [0u8; MAC_SIZE],
            }),
        }
    }

    /// Compute the MAC pair for an outgoing handshake message.
    ///
    /// MAC2 is zero unless a fresh cookie is held. The emitted MAC1 is
    /// remembered so a later cookie reply can be bound to it.
    pub fn mac(&self, buf: &[u8]) -> CookieMacs {
        let mut state = self.state.write();

        let mac1 = blake2s::mac(&self.mac1_key, buf);
        state.mac1_last = mac1;
        state.mac1_valid = true;

        let mac2 = if state.cookie_fresh() {
            blake2s::mac_with_cookie(&state.cookie, buf, &mac1)
        } else {
            [0u8; MAC_SIZE]
        };

        CookieMacs { mac1, mac2 }
    }

    /// Ingest an encrypted cookie reply.
    ///
    /// The reply must decrypt under the cookie key with the MAC1 we
    /// most recently emitted as additional data. A cookie is consumed
    /// at most once per emitted MAC1.
    pub fn consume_payload(
        &self,
        nonce: &[u8; NONCE_SIZE],
        encrypted: &[u8; ENCRYPTED_SIZE],
    ) -> Result<(), CookieReplyError> {
        let mut state = self.state.write();

        if !state.mac1_valid {
            return Err(CookieReplyError::Stale);
        }

        let mut plaintext = aead::xdecrypt(&self.cookie_key, nonce, encrypted, &state.mac1_last)
            .map_err(|_| CookieReplyError::Invalid)?;
        if plaintext.len() != COOKIE_SIZE {
            plaintext.zeroize();
            return Err(CookieReplyError::Invalid);
        }

        state.cookie.copy_from_slice(&plaintext);
        plaintext.zeroize();
        state.cookie_birthdate = Some(Instant::now());
        state.mac1_valid = false;

        tracing::debug!("stored new cookie");
        Ok(())
    }

    #[cfg(test)]
    fn backdate_cookie(&self, age: Duration) {
        self.state.write().cookie_birthdate = Instant::now().checked_sub(age);
    }
}

struct CheckerKeys {
    mac1_key: [u8; KEY_SIZE],
    cookie_key: [u8; KEY_SIZE],
}

struct CheckerSecret {
    secret: [u8; SECRET_SIZE],
    birthdate: Option<Instant>,
}

/// Responder-side cookie state for the local identity.
///
/// Validates the MAC pair on incoming handshake messages and
/// manufactures encrypted cookie challenges. Keys may be re-derived at
/// runtime with [`CookieChecker::update`]; the cookie secret rotates
/// lazily every [`COOKIE_SECRET_MAX_AGE`].
pub struct CookieChecker {
    keys: RwLock<CheckerKeys>,
    secret: Mutex<CheckerSecret>,
}

impl CookieChecker {
    /// Create a checker with zeroed keys. Call [`update`](Self::update)
    /// with the local identity input before validating anything.
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(CheckerKeys {
                mac1_key: [0u8; KEY_SIZE],
                cookie_key: [0u8; KEY_SIZE],
            }),
            secret: Mutex::new(CheckerSecret {
                secret: [0u8; SECRET_SIZE],
                birthdate: None,
            }),
        }
    }

    /// (Re)derive the MAC1 and cookie keys from an identity input, or
    /// zero both keys when `None`.
    pub fn update(&self, input: Option<&[u8; INPUT_SIZE]>) {
        let mut keys = self.keys.write();
        match input {
            Some(input) => {
                keys.mac1_key = precompute_key(LABEL_MAC1, input);
                keys.cookie_key = precompute_key(LABEL_COOKIE, input);
            }
            None => {
                keys.mac1_key.zeroize();
                keys.cookie_key.zeroize();
            }
        }
    }

    /// Build the encrypted cookie for a cookie-reply message.
    ///
    /// The cookie for `src` is encrypted under the cookie key with the
    /// received `mac1` as additional data, binding the challenge to the
    /// initiation that provoked it. Returns the random nonce and the
    /// ciphertext-plus-tag.
    pub fn create_payload(
        &self,
        mac1: &[u8; MAC_SIZE],
        src: SocketAddr,
    ) -> ([u8; NONCE_SIZE], [u8; ENCRYPTED_SIZE]) {
        let mut cookie = self.make_cookie(src);

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = {
            let keys = self.keys.read();
            aead::xencrypt(&keys.cookie_key, &nonce, &cookie, mac1)
        };
        cookie.zeroize();

        let mut encrypted = [0u8; ENCRYPTED_SIZE];
        encrypted.copy_from_slice(&ciphertext);
        (nonce, encrypted)
    }

    /// Validate the MAC pair on an incoming handshake message.
    ///
    /// MAC1 must always check out; a mismatch means silent drop. Under
    /// load (`busy`), MAC2 must additionally be keyed by the current
    /// cookie for `src`, and admitted sources are charged against the
    /// rate limiter. All comparisons are constant time.
    pub fn validate_macs(
        &self,
        buf: &[u8],
        macs: &CookieMacs,
        busy: bool,
        src: SocketAddr,
        limiters: &RateLimiters,
    ) -> Result<(), MacError> {
        let our_mac1 = {
            let keys = self.keys.read();
            blake2s::mac(&keys.mac1_key, buf)
        };
        if !bool::from(our_mac1.ct_eq(&macs.mac1)) {
            return Err(MacError::InvalidMac);
        }

        if !busy {
            return Ok(());
        }

        let mut cookie = self.make_cookie(src);
        let our_mac2 = blake2s::mac_with_cookie(&cookie, buf, &our_mac1);
        cookie.zeroize();

        if !bool::from(our_mac2.ct_eq(&macs.mac2)) {
            return Err(MacError::CookieRequired);
        }

        if limiters.allow(src.ip()) {
            Ok(())
        } else {
            Err(MacError::RateLimited)
        }
    }

    /// Derive the cookie for a source endpoint: keyed BLAKE2s of the
    /// address bytes and port under the rotating secret.
    ///
    /// The secret is regenerated when older than
    /// [`COOKIE_SECRET_MAX_AGE`], and copied out of the lock so the
    /// hash runs without it held.
    fn make_cookie(&self, src: SocketAddr) -> [u8; COOKIE_SIZE] {
        let mut secret = {
            let mut guard = self.secret.lock();
            let expired = guard
                .birthdate
                .map_or(true, |t| t.elapsed() > COOKIE_SECRET_MAX_AGE);
            if expired {
                OsRng.fill_bytes(&mut guard.secret);
                guard.birthdate = Some(Instant::now());
                tracing::debug!("rotated cookie secret");
            }
            guard.secret
        };

        let cookie = match src {
            SocketAddr::V4(sa) => {
                blake2s::mac_two(&secret, &sa.ip().octets(), &sa.port().to_be_bytes())
            }
            SocketAddr::V6(sa) => {
                blake2s::mac_two(&secret, &sa.ip().octets(), &sa.port().to_be_bytes())
            }
        };
        secret.zeroize();
        cookie
    }

    #[cfg(test)]
    fn backdate_secret(&self, age: Duration) {
        self.secret.lock().birthdate = Instant::now().checked_sub(age);
    }
}

impl Default for CookieChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENTITY: [u8; INPUT_SIZE] = [0x42u8; INPUT_SIZE];

    fn pair() -> (CookieMaker, CookieChecker) {
        let maker = CookieMaker::new(&IDENTITY);
        let checker = CookieChecker::new();
        checker.update(Some(&IDENTITY));
        (maker, checker)
    }

    fn src_v4() -> SocketAddr {
        "127.0.0.1:51820".parse().unwrap()
    }

    #[test]
    fn test_mac1_accepted_when_not_busy() {
        let (maker, checker) = pair();
        let limiters = RateLimiters::new().unwrap();
        let msg = b"handshake initiation";

        let macs = maker.mac(msg);
        assert!(!macs.mac1.iter().all(|&b| b == 0));
        assert!(macs.mac2.iter().all(|&b| b == 0)); // No cookie, so zeros

        assert_eq!(
            checker.validate_macs(msg, &macs, false, src_v4(), &limiters),
            Ok(())
        );
    }

    #[test]
    fn test_tampered_mac1_is_rejected() {
        let (maker, checker) = pair();
        let limiters = RateLimiters::new().unwrap();
        let msg = b"handshake initiation";

        let mut macs = maker.mac(msg);
        macs.mac1[0] ^= 0x01;

        assert_eq!(
            checker.validate_macs(msg, &macs, false, src_v4(), &limiters),
            Err(MacError::InvalidMac)
        );
    }

    #[test]
    fn test_tampered_buffer_is_rejected() {
        let (maker, checker) = pair();
        let limiters = RateLimiters::new().unwrap();

        let macs = maker.mac(b"handshake initiation");
        assert_eq!(
            checker.validate_macs(b"handshake Initiation", &macs, false, src_v4(), &limiters),
            Err(MacError::InvalidMac)
        );
    }

    #[test]
    fn test_busy_without_cookie_requires_cookie() {
        let (maker, checker) = pair();
        let limiters = RateLimiters::new().unwrap();
        let msg = b"handshake initiation";

        let macs = maker.mac(msg);
        assert_eq!(
            checker.validate_macs(msg, &macs, true, src_v4(), &limiters),
            Err(MacError::CookieRequired)
        );
    }

    #[test]
    fn test_cookie_challenge_roundtrip() {
        let (maker, checker) = pair();
        let limiters = RateLimiters::new().unwrap();
        let src = src_v4();

        // First attempt under load is challenged.
        let macs = maker.mac(b"attempt one");
        assert_eq!(
            checker.validate_macs(b"attempt one", &macs, true, src, &limiters),
            Err(MacError::CookieRequired)
        );

        // The challenge round-trips into the maker.
        let (nonce, encrypted) = checker.create_payload(&macs.mac1, src);
        assert_eq!(maker.consume_payload(&nonce, &encrypted), Ok(()));

        // The retry carries a non-zero MAC2 the checker accepts.
        let macs = maker.mac(b"attempt two");
        assert!(!macs.mac2.iter().all(|&b| b == 0));
        assert_eq!(
            checker.validate_macs(b"attempt two", &macs, true, src, &limiters),
            Ok(())
        );
    }

    #[test]
    fn test_cookie_is_bound_to_source_address() {
        let (maker, checker) = pair();
        let limiters = RateLimiters::new().unwrap();

        let macs = maker.mac(b"attempt one");
        let (nonce, encrypted) = checker.create_payload(&macs.mac1, src_v4());
        assert_eq!(maker.consume_payload(&nonce, &encrypted), Ok(()));

        // A MAC2 keyed by 127.0.0.1's cookie does not validate for
        // another source.
        let other: SocketAddr = "198.51.100.9:51820".parse().unwrap();
        let macs = maker.mac(b"attempt two");
        assert_eq!(
            checker.validate_macs(b"attempt two", &macs, true, other, &limiters),
            Err(MacError::CookieRequired)
        );
    }

    #[test]
    fn test_tampered_cookie_reply_is_invalid() {
        let (maker, checker) = pair();

        let macs = maker.mac(b"attempt one");
        let (nonce, mut encrypted) = checker.create_payload(&macs.mac1, src_v4());
        *encrypted.last_mut().unwrap() ^= 0x01;

        assert_eq!(
            maker.consume_payload(&nonce, &encrypted),
            Err(CookieReplyError::Invalid)
        );
    }

    #[test]
    fn test_cookie_reply_without_pending_mac1_is_stale() {
        let (maker, checker) = pair();

        // No mac() emitted yet.
        let macs = CookieMacs::default();
        let (nonce, encrypted) = checker.create_payload(&macs.mac1, src_v4());
        assert_eq!(
            maker.consume_payload(&nonce, &encrypted),
            Err(CookieReplyError::Stale)
        );
    }

    #[test]
    fn test_cookie_reply_consumed_at_most_once() {
        let (maker, checker) = pair();

        let macs = maker.mac(b"attempt one");
        let (nonce, encrypted) = checker.create_payload(&macs.mac1, src_v4());
        assert_eq!(maker.consume_payload(&nonce, &encrypted), Ok(()));

        // The pending MAC1 was spent by the first consume.
        assert_eq!(
            maker.consume_payload(&nonce, &encrypted),
            Err(CookieReplyError::Stale)
        );
    }

    #[test]
    fn test_aged_cookie_downgrades_to_zero_mac2() {
        let (maker, checker) = pair();

        let macs = maker.mac(b"attempt one");
        let (nonce, encrypted) = checker.create_payload(&macs.mac1, src_v4());
        assert_eq!(maker.consume_payload(&nonce, &encrypted), Ok(()));

        maker.backdate_cookie(COOKIE_SECRET_MAX_AGE - COOKIE_SECRET_LATENCY + Duration::from_secs(1));

        let macs = maker.mac(b"attempt two");
        assert!(macs.mac2.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_secret_rotation_changes_cookie() {
        let checker = CookieChecker::new();
        checker.update(Some(&IDENTITY));
        let src = src_v4();

        let before = checker.make_cookie(src);
        assert_eq!(before, checker.make_cookie(src));

        checker.backdate_secret(COOKIE_SECRET_MAX_AGE + Duration::from_secs(1));
        let after = checker.make_cookie(src);
        assert_ne!(before, after);
    }

    #[test]
    fn test_cookies_differ_per_endpoint() {
        let checker = CookieChecker::new();
        checker.update(Some(&IDENTITY));

        let a = checker.make_cookie("10.0.0.1:51820".parse().unwrap());
        let b = checker.make_cookie("10.0.0.2:51820".parse().unwrap());
        let c = checker.make_cookie("10.0.0.1:51821".parse().unwrap());
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_update_none_zeroes_keys() {
        let (maker, checker) = pair();
        let limiters = RateLimiters::new().unwrap();
        let msg = b"handshake initiation";

        let macs = maker.mac(msg);
        checker.update(None);

        assert_eq!(
            checker.validate_macs(msg, &macs, false, src_v4(), &limiters),
            Err(MacError::InvalidMac)
        );
    }

    #[test]
    fn test_ipv6_source_roundtrip() {
        let (maker, checker) = pair();
        let limiters = RateLimiters::new().unwrap();
        let src: SocketAddr = "[2001:db8::7]:51820".parse().unwrap();

        let macs = maker.mac(b"attempt one");
        let (nonce, encrypted) = checker.create_payload(&macs.mac1, src);
        assert_eq!(maker.consume_payload(&nonce, &encrypted), Ok(()));

        let macs = maker.mac(b"attempt two");
        assert_eq!(
            checker.validate_macs(b"attempt two", &macs, true, src, &limiters),
            Ok(())
        );
    }
}
