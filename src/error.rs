//! Error types for the cookie subsystem
//!
//! Every failure is a distinct variant so the enclosing handshake state
//! machine can pick the correct response (drop, send a cookie reply, ...).
//! No retries happen inside this crate.

use thiserror::Error;

/// Failures when bringing up the rate-limit tables.
///
/// Only possible at startup; once a limiter exists, admission
/// decisions never error.
#[derive(Error, Debug)]
pub enum InitError {
    /// The system refused resources for the GC worker thread.
    #[error("failed to spawn rate-limit GC worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Cryptographic operation errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("decryption failed: invalid ciphertext or authentication tag")]
    Decryption,
}

/// Failures when an initiator ingests a cookie reply.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieReplyError {
    /// No handshake initiation is awaiting a cookie; the reply arrived
    /// after the pending MAC1 was already consumed or never existed.
    #[error("no initiation pending for this cookie reply")]
    Stale,

    /// The encrypted cookie failed authentication.
    #[error("cookie decryption failed: invalid ciphertext or authentication tag")]
    Invalid,
}

/// Failures when a responder validates the MACs on a handshake message.
///
/// Success means the message may be processed. Each error implies a
/// different caller action, per the WireGuard protocol.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacError {
    /// MAC1 mismatch. The caller must drop the packet silently.
    #[error("MAC1 verification failed")]
    InvalidMac,

    /// MAC2 missing or invalid while the responder is under load.
    /// The caller should answer with an encrypted cookie reply.
    #[error("cookie required: MAC2 missing or invalid under load")]
    CookieRequired,

    /// The source prefix exceeded its initiation budget, or the
    /// rate-limit table is out of room. The caller must drop.
    #[error("handshake initiation rate limited")]
    RateLimited,
}
