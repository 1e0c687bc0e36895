//! The errors reported by the HSM layer.

use std::fmt;
use std::path::PathBuf;

use openssl::error::ErrorStack;

use crate::dns::DnsError;


//------------ Rv ------------------------------------------------------------

/// A PKCS#11 return value.
///
/// Only failures are ever represented, `CKR_OK` never leaves a provider.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Rv(pub u64);

impl Rv {
    pub const SLOT_ID_INVALID: Rv = Rv(0x03);
    pub const GENERAL_ERROR: Rv = Rv(0x05);
    pub const FUNCTION_FAILED: Rv = Rv(0x06);
    pub const ARGUMENTS_BAD: Rv = Rv(0x07);
    pub const ATTRIBUTE_SENSITIVE: Rv = Rv(0x11);
    pub const ATTRIBUTE_TYPE_INVALID: Rv = Rv(0x12);
    pub const ATTRIBUTE_VALUE_INVALID: Rv = Rv(0x13);
    pub const DATA_LEN_RANGE: Rv = Rv(0x21);
    pub const DEVICE_ERROR: Rv = Rv(0x30);
    pub const DEVICE_REMOVED: Rv = Rv(0x32);
    pub const KEY_HANDLE_INVALID: Rv = Rv(0x60);
    pub const KEY_TYPE_INCONSISTENT: Rv = Rv(0x63);
    pub const MECHANISM_INVALID: Rv = Rv(0x70);
    pub const OBJECT_HANDLE_INVALID: Rv = Rv(0x82);
    pub const PIN_INCORRECT: Rv = Rv(0xa0);
    pub const PIN_LEN_RANGE: Rv = Rv(0xa2);
    pub const SESSION_CLOSED: Rv = Rv(0xb0);
    pub const SESSION_HANDLE_INVALID: Rv = Rv(0xb3);
    pub const TEMPLATE_INCOMPLETE: Rv = Rv(0xd0);
    pub const TEMPLATE_INCONSISTENT: Rv = Rv(0xd1);
    pub const TOKEN_NOT_PRESENT: Rv = Rv(0xe0);
    pub const USER_ALREADY_LOGGED_IN: Rv = Rv(0x100);
    pub const USER_NOT_LOGGED_IN: Rv = Rv(0x101);
    pub const CURVE_NOT_SUPPORTED: Rv = Rv(0x140);
    pub const BUFFER_TOO_SMALL: Rv = Rv(0x150);
    pub const CRYPTOKI_NOT_INITIALIZED: Rv = Rv(0x190);
    pub const CRYPTOKI_ALREADY_INITIALIZED: Rv = Rv(0x191);

    /// Returns the symbolic name of the return value if we know it.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Rv::SLOT_ID_INVALID => "CKR_SLOT_ID_INVALID",
            Rv::GENERAL_ERROR => "CKR_GENERAL_ERROR",
            Rv::FUNCTION_FAILED => "CKR_FUNCTION_FAILED",
            Rv::ARGUMENTS_BAD => "CKR_ARGUMENTS_BAD",
            Rv::ATTRIBUTE_SENSITIVE => "CKR_ATTRIBUTE_SENSITIVE",
            Rv::ATTRIBUTE_TYPE_INVALID => "CKR_ATTRIBUTE_TYPE_INVALID",
            Rv::ATTRIBUTE_VALUE_INVALID => "CKR_ATTRIBUTE_VALUE_INVALID",
            Rv::DATA_LEN_RANGE => "CKR_DATA_LEN_RANGE",
            Rv::DEVICE_ERROR => "CKR_DEVICE_ERROR",
            Rv::DEVICE_REMOVED => "CKR_DEVICE_REMOVED",
            Rv::KEY_HANDLE_INVALID => "CKR_KEY_HANDLE_INVALID",
            Rv::KEY_TYPE_INCONSISTENT => "CKR_KEY_TYPE_INCONSISTENT",
            Rv::MECHANISM_INVALID => "CKR_MECHANISM_INVALID",
            Rv::OBJECT_HANDLE_INVALID => "CKR_OBJECT_HANDLE_INVALID",
            Rv::PIN_INCORRECT => "CKR_PIN_INCORRECT",
            Rv::PIN_LEN_RANGE => "CKR_PIN_LEN_RANGE",
            Rv::SESSION_CLOSED => "CKR_SESSION_CLOSED",
            Rv::SESSION_HANDLE_INVALID => "CKR_SESSION_HANDLE_INVALID",
            Rv::TEMPLATE_INCOMPLETE => "CKR_TEMPLATE_INCOMPLETE",
            Rv::TEMPLATE_INCONSISTENT => "CKR_TEMPLATE_INCONSISTENT",
            Rv::TOKEN_NOT_PRESENT => "CKR_TOKEN_NOT_PRESENT",
            Rv::USER_ALREADY_LOGGED_IN => "CKR_USER_ALREADY_LOGGED_IN",
            Rv::USER_NOT_LOGGED_IN => "CKR_USER_NOT_LOGGED_IN",
            Rv::CURVE_NOT_SUPPORTED => "CKR_CURVE_NOT_SUPPORTED",
            Rv::BUFFER_TOO_SMALL => "CKR_BUFFER_TOO_SMALL",
            Rv::CRYPTOKI_NOT_INITIALIZED => "CKR_CRYPTOKI_NOT_INITIALIZED",
            Rv::CRYPTOKI_ALREADY_INITIALIZED => "CKR_CRYPTOKI_ALREADY_INITIALIZED",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for Rv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:x})", name, self.0),
            None => write!(f, "0x{:x}", self.0),
        }
    }
}


//------------ DeviceError ---------------------------------------------------

/// A failed call into a provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceError {
    function: &'static str,
    rv: Rv,
    detail: Option<String>,
}

impl DeviceError {
    pub fn new(function: &'static str, rv: Rv) -> Self {
        DeviceError {
            function,
            rv,
            detail: None,
        }
    }

    pub fn with_detail(function: &'static str, rv: Rv, detail: impl Into<String>) -> Self {
        DeviceError {
            function,
            rv,
            detail: Some(detail.into()),
        }
    }

    /// The name of the PKCS#11 function that failed, e.g. `C_Login`.
    pub fn function(&self) -> &'static str {
        self.function
    }

    pub fn rv(&self) -> Rv {
        self.rv
    }

    pub fn is(&self, rv: Rv) -> bool {
        self.rv == rv
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} failed: {}", self.function, self.rv)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

impl std::error::Error for DeviceError {}


//------------ EncodingError -------------------------------------------------

/// Malformed key material encountered while building public key RDATA.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EncodingError {
    /// The buffer ends before the DER header or content is complete.
    ShortBuffer { needed: usize, available: usize },

    /// The DER identifier octet is not OCTET STRING.
    WrongTag(u8),

    /// The DER length uses the indefinite form.
    IndefiniteLength,

    /// The DER length disagrees with the content present.
    LengthMismatch { expected: usize, actual: usize },

    /// An EC point is in compressed form.
    CompressedPoint,

    /// An EC point does not start with the uncompressed marker.
    MissingUncompressedMarker(u8),

    /// An RSA public exponent does not fit a one byte length field.
    ExponentTooLong(usize),

    /// An EdDSA point of a size that matches no known curve.
    InvalidEddsaLength(usize),

    /// DSA domain parameters that cannot be expressed in DNSKEY RDATA.
    InvalidDsaParameters(String),

    /// A required key component is missing or empty.
    MissingComponent(&'static str),
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EncodingError::ShortBuffer { needed, available } => {
                write!(f, "buffer too short: need {} bytes, have {}", needed, available)
            }
            EncodingError::WrongTag(tag) => write!(f, "expected OCTET STRING (0x04), found tag 0x{:02x}", tag),
            EncodingError::IndefiniteLength => write!(f, "indefinite length encoding is not allowed"),
            EncodingError::LengthMismatch { expected, actual } => {
                write!(f, "length mismatch: header says {} bytes, found {}", expected, actual)
            }
            EncodingError::CompressedPoint => write!(f, "compressed EC points are not supported"),
            EncodingError::MissingUncompressedMarker(marker) => {
                write!(f, "expected uncompressed point marker 0x04, found 0x{:02x}", marker)
            }
            EncodingError::ExponentTooLong(len) => write!(f, "RSA public exponent of {} bytes is too long", len),
            EncodingError::InvalidEddsaLength(len) => write!(f, "EdDSA point of {} bytes matches no curve", len),
            EncodingError::InvalidDsaParameters(msg) => write!(f, "invalid DSA parameters: {}", msg),
            EncodingError::MissingComponent(name) => write!(f, "key component '{}' is missing", name),
        }
    }
}

impl std::error::Error for EncodingError {}


//------------ HsmError ------------------------------------------------------

#[derive(Debug)]
pub enum HsmError {
    /// The provider library could not be loaded.
    ModuleNotFound { path: PathBuf, reason: String },

    /// No slot carries a token with the configured label.
    RepositoryNotFound(String),

    /// The token refused the PIN for the named repository.
    PinIncorrect(String),

    /// Nobody could supply a PIN for the named repository.
    PinUnavailable(String),

    Device(DeviceError),
    Encoding(EncodingError),
    Generation(String),
    Signing(String),

    /// An attach call did not attach anything.
    NoRepositories,

    KeyNotFound(String),
    InvalidKey(String),
    InvalidArgument(String),
    Dns(DnsError),
    OpenSsl(ErrorStack),
    ContextError(String),
}

impl HsmError {
    pub fn generation(msg: impl fmt::Display) -> Self {
        HsmError::Generation(msg.to_string())
    }

    pub fn signing(msg: impl fmt::Display) -> Self {
        HsmError::Signing(msg.to_string())
    }

    pub fn invalid_argument(msg: impl fmt::Display) -> Self {
        HsmError::InvalidArgument(msg.to_string())
    }

    pub fn invalid_key(msg: impl fmt::Display) -> Self {
        HsmError::InvalidKey(msg.to_string())
    }

    /// Returns the device error underneath, if any.
    pub fn device_error(&self) -> Option<&DeviceError> {
        match self {
            HsmError::Device(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for HsmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HsmError::ModuleNotFound { path, reason } => {
                write!(f, "Could not load provider library '{}': {}", path.display(), reason)
            }
            HsmError::RepositoryNotFound(label) => write!(f, "No token with label '{}' found", label),
            HsmError::PinIncorrect(repository) => write!(f, "Incorrect PIN for repository '{}'", repository),
            HsmError::PinUnavailable(repository) => write!(f, "No PIN available for repository '{}'", repository),
            HsmError::Device(e) => write!(f, "Device error: {}", e),
            HsmError::Encoding(e) => write!(f, "Encoding error: {}", e),
            HsmError::Generation(e) => write!(f, "Key generation failed: {}", e),
            HsmError::Signing(e) => write!(f, "Signing failed: {}", e),
            HsmError::NoRepositories => write!(f, "No repositories were attached"),
            HsmError::KeyNotFound(locator) => write!(f, "Could not find key with id '{}'", locator),
            HsmError::InvalidKey(e) => write!(f, "Invalid key: {}", e),
            HsmError::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            HsmError::Dns(e) => write!(f, "DNS error: {}", e),
            HsmError::OpenSsl(e) => write!(f, "OpenSsl Error: {}", e),
            HsmError::ContextError(e) => write!(f, "Context error: {}", e),
        }
    }
}

impl std::error::Error for HsmError {}

impl From<DeviceError> for HsmError {
    fn from(e: DeviceError) -> Self {
        HsmError::Device(e)
    }
}

impl From<EncodingError> for HsmError {
    fn from(e: EncodingError) -> Self {
        HsmError::Encoding(e)
    }
}

impl From<DnsError> for HsmError {
    fn from(e: DnsError) -> Self {
        HsmError::Dns(e)
    }
}

impl From<ErrorStack> for HsmError {
    fn from(e: ErrorStack) -> Self {
        HsmError::OpenSsl(e)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_name_known_return_values() {
        assert_eq!(Rv::PIN_INCORRECT.name(), Some("CKR_PIN_INCORRECT"));
        assert_eq!(Rv(0x8000_0001).name(), None);
        assert_eq!(Rv::MECHANISM_INVALID.to_string(), "CKR_MECHANISM_INVALID (0x70)");
        assert_eq!(Rv(0x8000_0001).to_string(), "0x80000001");
    }

    #[test]
    fn should_render_device_errors() {
        let err = DeviceError::new("C_Login", Rv::PIN_INCORRECT);
        assert_eq!(err.to_string(), "C_Login failed: CKR_PIN_INCORRECT (0xa0)");
        assert!(err.is(Rv::PIN_INCORRECT));

        let err = DeviceError::with_detail("C_Sign", Rv::GENERAL_ERROR, "boom");
        assert_eq!(err.to_string(), "C_Sign failed: CKR_GENERAL_ERROR (0x5): boom");
    }
}
