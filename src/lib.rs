//! CookieGuard - handshake DoS defense for WireGuard-style tunnels
//!
//! Implements the cookie subsystem a responder uses to defend itself
//! against computational denial-of-service during handshakes:
//!
//! - MAC1/MAC2 generation on outgoing handshake messages ([`CookieMaker`])
//! - MAC validation and encrypted cookie challenges ([`CookieChecker`])
//! - Token-bucket admission control per source prefix ([`RateLimiters`])
//!
//! The enclosing handshake state machine, packet parsing, and socket I/O
//! are the caller's business; this crate only sees message buffers, MAC
//! tags, and source addresses.
//!
//! # Usage
//!
//! ```
//! use cookieguard::{CookieChecker, CookieMaker, RateLimiters};
//!
//! let identity = [0x55u8; 32];
//!
//! // Initiator side, keyed by the responder's identity.
//! let maker = CookieMaker::new(&identity);
//!
//! // Responder side, keyed by its own identity.
//! let checker = CookieChecker::new();
//! checker.update(Some(&identity));
//! let limiters = RateLimiters::new()?;
//!
//! let msg = b"handshake initiation";
//! let macs = maker.mac(msg);
//! let src = "203.0.113.7:51820".parse().unwrap();
//! assert!(checker.validate_macs(msg, &macs, false, src, &limiters).is_ok());
//! # Ok::<(), cookieguard::InitError>(())
//! ```

pub mod crypto;
pub mod error;
pub mod protocol;
pub mod ratelimit;

pub use error::{CookieReplyError, InitError, MacError};
pub use protocol::cookie::{CookieChecker, CookieMacs, CookieMaker};
pub use ratelimit::RateLimiters;
