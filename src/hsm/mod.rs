//! Keys and signatures on hardware security modules.
//!
//! Repositories are tokens in PKCS#11 providers. An [`HsmService`] attaches
//! them once and hands out a [`Context`] per worker, which is used for all
//! key and signing operations.

pub mod cache;
pub mod context;
pub mod key;
pub mod module;
pub mod pin;
pub mod provider;
pub mod rdata;
pub mod service;
pub mod session;
pub mod signing;
pub mod slot;
pub mod verify;

pub use self::cache::KeyCache;
pub use self::context::{Context, LatchedError};
pub use self::key::{KeyAlgorithm, KeyHandle, KeyInfo, KeyParams};
pub use self::pin::{ConfiguredPins, CredentialStore, PinCache, PromptPins};
pub use self::provider::BuiltinProvider;
pub use self::service::HsmService;
pub use self::session::{KeyPolicy, Session};
pub use self::signing::{SignParams, algorithm_family};
pub use self::verify::{verify_rrsig, verify_signature};
