//! Handshake DoS-protection components
//!
//! - MAC1/MAC2 construction on outgoing handshake messages
//! - MAC validation and encrypted cookie challenges on incoming ones

pub mod cookie;

pub use cookie::{CookieChecker, CookieMacs, CookieMaker};
