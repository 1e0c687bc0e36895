//! Various crate-wide constants.


//------------ Binary Names -------------------------------------------------

/// The friendly name of the `hsmutil` binary.
pub const HSMUTIL_APP: &str = "HSM Utility";

/// The version of this crate.
pub const KASP_HSM_VERSION: &str = env!("CARGO_PKG_VERSION");


//------------ Config Files Paths -------------------------------------------

/// The default path to the config file.
pub const KASP_HSM_DEFAULT_CONFIG_FILE: &str = "/etc/kasp-hsm/kasp-hsm.conf";


//------------ Environment Variables ----------------------------------------

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file. The default is “info.”
pub const KASP_HSM_ENV_LOG_LEVEL: &str = "KASP_HSM_LOG_LEVEL";

/// The environment variable with the path to the config file.
pub const KASP_HSM_ENV_CONFIG: &str = "KASP_HSM_CONFIG";


//------------ Sessions and Credentials -------------------------------------

/// The maximum number of sessions a context can hold.
///
/// This also bounds the number of repositories that can be attached and the
/// number of slots in a credential store.
pub const HSM_MAX_SESSIONS: usize = 100;

/// The maximum length of a PIN in bytes.
pub const HSM_MAX_PIN_LENGTH: usize = 255;

/// The size of the token label field of a PKCS#11 token.
pub const TOKEN_LABEL_LENGTH: usize = 32;


//------------ Keys ---------------------------------------------------------

/// The length of the random CKA_ID assigned to generated keys.
pub const KEY_ID_LENGTH: usize = 16;

/// How often we try to come up with an unused key identifier.
pub const MAX_ID_ATTEMPTS: usize = 16;

/// The public exponent used for RSA keys, as big-endian bytes.
pub const RSA_PUBLIC_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

/// The key size reported for GOST R 34.10-2001 keys.
pub const GOST_KEY_SIZE: u32 = 512;

/// The maximum length of an algorithm name as reported in key info.
pub const HSM_MAX_ALGONAME: usize = 16;


//------------ Signing ------------------------------------------------------

/// The largest signature we accept from a device.
pub const HSM_MAX_SIGNATURE_LENGTH: usize = 1024;

/// The default validity of a signature in seconds (four weeks).
pub const DEFAULT_SIGNATURE_VALIDITY: u32 = 4 * 7 * 24 * 3600;

/// The value of the protocol field of DNSKEY records.
pub const DNSKEY_PROTOCOL: u8 = 3;

/// The TTL used for DNSKEY records we produce.
pub const DEFAULT_DNSKEY_TTL: u32 = 3600;

/// The ZONE flag of a DNSKEY record.
pub const DNSKEY_FLAG_ZONE: u16 = 0x0100;

/// The SEP flag of a DNSKEY record.
pub const DNSKEY_FLAG_SEP: u16 = 0x0001;
