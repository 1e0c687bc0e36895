//! DNSSEC keys on hardware security modules.
//!
//! The crate attaches PKCS#11 tokens as named repositories, generates and
//! finds key pairs on them, produces DNSKEY records for those keys and signs
//! RRsets with them. A built-in software provider stands in for a real
//! token where none is available.

pub mod cli;
pub mod config;
pub mod constants;
pub mod dns;
pub mod error;
pub mod hsm;
