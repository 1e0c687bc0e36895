//! Access to the cryptographic token providers.
//!
//! A provider is either a PKCS#11 library loaded at run time or the built-in
//! software token. Both are driven through the same set of PKCS#11 style
//! calls on [`Provider`]. Handles for sessions and objects are opaque
//! numbers that only mean something to the provider that issued them.

use std::fmt;
use std::sync::Arc;

use crate::constants::TOKEN_LABEL_LENGTH;
use crate::error::DeviceError;

#[cfg(feature = "hsm")]
pub mod pkcs11;
pub mod soft;

#[cfg(feature = "hsm")]
pub use self::pkcs11::Pkcs11Provider;
pub use self::soft::BuiltinProvider;


//------------ Handles -------------------------------------------------------

/// Identifies a slot of a provider.
pub type SlotId = u64;

/// A device session, as issued by a provider.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub fn new(value: u64) -> Self {
        SessionHandle(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// An object stored on a token, as issued by a provider.
///
/// Object handles stay valid across all sessions of the provider, but not
/// beyond the provider being finalized.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObjectHandle(u64);

impl ObjectHandle {
    pub fn new(value: u64) -> Self {
        ObjectHandle(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}


//------------ ObjectClass ---------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ObjectClass {
    PublicKey,
    PrivateKey,
    SecretKey,
    DomainParameters,
}


//------------ KeyType -------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum KeyType {
    Rsa,
    Dsa,
    Ec,
    EcEdwards,
    Gost,
}


//------------ AttributeType -------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AttributeType {
    Class,
    KeyType,
    Id,
    Label,
    Token,
    Private,
    Sensitive,
    Extractable,
    Sign,
    Verify,
    Encrypt,
    Decrypt,
    Wrap,
    Unwrap,
    Modulus,
    ModulusBits,
    PublicExponent,
    Prime,
    SubPrime,
    Base,
    PrimeBits,
    Value,
    EcParams,
    EcPoint,
    GostR3410Params,
    GostR3411Params,
}


//------------ Attribute -----------------------------------------------------

/// An attribute of a token object with its value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Attribute {
    Class(ObjectClass),
    KeyType(KeyType),
    Id(Vec<u8>),
    Label(Vec<u8>),
    Token(bool),
    Private(bool),
    Sensitive(bool),
    Extractable(bool),
    Sign(bool),
    Verify(bool),
    Encrypt(bool),
    Decrypt(bool),
    Wrap(bool),
    Unwrap(bool),
    Modulus(Vec<u8>),
    ModulusBits(u64),
    PublicExponent(Vec<u8>),
    Prime(Vec<u8>),
    SubPrime(Vec<u8>),
    Base(Vec<u8>),
    PrimeBits(u64),
    Value(Vec<u8>),
    EcParams(Vec<u8>),
    EcPoint(Vec<u8>),
    GostR3410Params(Vec<u8>),
    GostR3411Params(Vec<u8>),
}

impl Attribute {
    pub fn attribute_type(&self) -> AttributeType {
        match self {
            Attribute::Class(_) => AttributeType::Class,
            Attribute::KeyType(_) => AttributeType::KeyType,
            Attribute::Id(_) => AttributeType::Id,
            Attribute::Label(_) => AttributeType::Label,
            Attribute::Token(_) => AttributeType::Token,
            Attribute::Private(_) => AttributeType::Private,
            Attribute::Sensitive(_) => AttributeType::Sensitive,
            Attribute::Extractable(_) => AttributeType::Extractable,
            Attribute::Sign(_) => AttributeType::Sign,
            Attribute::Verify(_) => AttributeType::Verify,
            Attribute::Encrypt(_) => AttributeType::Encrypt,
            Attribute::Decrypt(_) => AttributeType::Decrypt,
            Attribute::Wrap(_) => AttributeType::Wrap,
            Attribute::Unwrap(_) => AttributeType::Unwrap,
            Attribute::Modulus(_) => AttributeType::Modulus,
            Attribute::ModulusBits(_) => AttributeType::ModulusBits,
            Attribute::PublicExponent(_) => AttributeType::PublicExponent,
            Attribute::Prime(_) => AttributeType::Prime,
            Attribute::SubPrime(_) => AttributeType::SubPrime,
            Attribute::Base(_) => AttributeType::Base,
            Attribute::PrimeBits(_) => AttributeType::PrimeBits,
            Attribute::Value(_) => AttributeType::Value,
            Attribute::EcParams(_) => AttributeType::EcParams,
            Attribute::EcPoint(_) => AttributeType::EcPoint,
            Attribute::GostR3410Params(_) => AttributeType::GostR3410Params,
            Attribute::GostR3411Params(_) => AttributeType::GostR3411Params,
        }
    }

    /// Returns the value of byte string attributes.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Attribute::Id(v)
            | Attribute::Label(v)
            | Attribute::Modulus(v)
            | Attribute::PublicExponent(v)
            | Attribute::Prime(v)
            | Attribute::SubPrime(v)
            | Attribute::Base(v)
            | Attribute::Value(v)
            | Attribute::EcParams(v)
            | Attribute::EcPoint(v)
            | Attribute::GostR3410Params(v)
            | Attribute::GostR3411Params(v) => Some(v),
            _ => None,
        }
    }
}

/// Finds the first attribute of the given type in a list.
pub fn find_attribute(attrs: &[Attribute], attr_type: AttributeType) -> Option<&Attribute> {
    attrs.iter().find(|attr| attr.attribute_type() == attr_type)
}

/// Finds the value of the first byte string attribute of the given type.
pub fn find_bytes(attrs: &[Attribute], attr_type: AttributeType) -> Option<&[u8]> {
    find_attribute(attrs, attr_type).and_then(Attribute::bytes)
}


//------------ Mechanism -----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Mechanism {
    RsaPkcsKeyPairGen,
    DsaParameterGen,
    DsaKeyPairGen,
    GostR3410KeyPairGen,
    EcKeyPairGen,
    EcEdwardsKeyPairGen,
    RsaPkcs,
    Dsa,
    GostR3410,
    Ecdsa,
    Eddsa,
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
    GostR3411,
}


/// Pads a token label to the fixed size PKCS#11 label field.
///
/// Labels longer than the field are cut short.
pub fn pad_label(label: &str) -> Vec<u8> {
    let mut res: Vec<u8> = label.bytes().take(TOKEN_LABEL_LENGTH).collect();
    res.resize(TOKEN_LABEL_LENGTH, b' ');
    res
}


//------------ oid -----------------------------------------------------------

/// DER encoded object identifiers used as key generation parameters.
pub mod oid {
    /// NIST P-256, as CKA_EC_PARAMS.
    pub const P256: &[u8] = &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];

    /// NIST P-384, as CKA_EC_PARAMS.
    pub const P384: &[u8] = &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x22];

    /// Ed25519, as CKA_EC_PARAMS.
    pub const ED25519: &[u8] = &[0x06, 0x03, 0x2b, 0x65, 0x70];

    /// Ed448, as CKA_EC_PARAMS.
    pub const ED448: &[u8] = &[0x06, 0x03, 0x2b, 0x65, 0x71];

    /// GOST R 34.10-2001 CryptoPro-A parameter set.
    pub const GOST_R3410_PARAMS: &[u8] = &[0x06, 0x07, 0x2a, 0x85, 0x03, 0x02, 0x02, 0x23, 0x01];

    /// GOST R 34.11-94 CryptoPro parameter set.
    pub const GOST_R3411_PARAMS: &[u8] = &[0x06, 0x07, 0x2a, 0x85, 0x03, 0x02, 0x02, 0x1e, 0x01];
}


//------------ SessionInfo ---------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionInfo {
    pub slot: SlotId,
}


//------------ Provider ------------------------------------------------------

/// A provider of tokens.
///
/// All calls are blocking and map one to one onto the PKCS#11 function of
/// the same name.
#[derive(Clone, Debug)]
pub enum Provider {
    #[cfg(feature = "hsm")]
    Pkcs11(Arc<Pkcs11Provider>),
    Builtin(Arc<BuiltinProvider>),
}

impl Provider {
    pub fn name(&self) -> String {
        match self {
            #[cfg(feature = "hsm")]
            Provider::Pkcs11(p) => p.name(),
            Provider::Builtin(p) => p.name(),
        }
    }

    pub fn initialize(&self) -> Result<(), DeviceError> {
        match self {
            #[cfg(feature = "hsm")]
            Provider::Pkcs11(p) => p.initialize(),
            Provider::Builtin(p) => p.initialize(),
        }
    }

    pub fn finalize(&self) -> Result<(), DeviceError> {
        match self {
            #[cfg(feature = "hsm")]
            Provider::Pkcs11(p) => p.finalize(),
            Provider::Builtin(p) => p.finalize(),
        }
    }

    pub fn slots_with_token(&self) -> Result<Vec<SlotId>, DeviceError> {
        match self {
            #[cfg(feature = "hsm")]
            Provider::Pkcs11(p) => p.slots_with_token(),
            Provider::Builtin(p) => p.slots_with_token(),
        }
    }

    /// Returns the raw, space padded token label of the token in a slot.
    pub fn token_label(&self, slot: SlotId) -> Result<Vec<u8>, DeviceError> {
        match self {
            #[cfg(feature = "hsm")]
            Provider::Pkcs11(p) => p.token_label(slot),
            Provider::Builtin(p) => p.token_label(slot),
        }
    }

    pub fn open_session(&self, slot: SlotId) -> Result<SessionHandle, DeviceError> {
        match self {
            #[cfg(feature = "hsm")]
            Provider::Pkcs11(p) => p.open_session(slot),
            Provider::Builtin(p) => p.open_session(slot),
        }
    }

    pub fn close_session(&self, session: SessionHandle) -> Result<(), DeviceError> {
        match self {
            #[cfg(feature = "hsm")]
            Provider::Pkcs11(p) => p.close_session(session),
            Provider::Builtin(p) => p.close_session(session),
        }
    }

    pub fn session_info(&self, session: SessionHandle) -> Result<SessionInfo, DeviceError> {
        match self {
            #[cfg(feature = "hsm")]
            Provider::Pkcs11(p) => p.session_info(session),
            Provider::Builtin(p) => p.session_info(session),
        }
    }

    pub fn login(&self, session: SessionHandle, pin: &str) -> Result<(), DeviceError> {
        match self {
            #[cfg(feature = "hsm")]
            Provider::Pkcs11(p) => p.login(session, pin),
            Provider::Builtin(p) => p.login(session, pin),
        }
    }

    pub fn logout(&self, session: SessionHandle) -> Result<(), DeviceError> {
        match self {
            #[cfg(feature = "hsm")]
            Provider::Pkcs11(p) => p.logout(session),
            Provider::Builtin(p) => p.logout(session),
        }
    }

    pub fn find_objects(
        &self,
        session: SessionHandle,
        template: &[Attribute],
    ) -> Result<Vec<ObjectHandle>, DeviceError> {
        match self {
            #[cfg(feature = "hsm")]
            Provider::Pkcs11(p) => p.find_objects(session, template),
            Provider::Builtin(p) => p.find_objects(session, template),
        }
    }

    /// Reads attributes of an object.
    ///
    /// Attributes the object does not have or will not reveal are left out
    /// of the result.
    pub fn get_attributes(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        types: &[AttributeType],
    ) -> Result<Vec<Attribute>, DeviceError> {
        match self {
            #[cfg(feature = "hsm")]
            Provider::Pkcs11(p) => p.get_attributes(session, object, types),
            Provider::Builtin(p) => p.get_attributes(session, object, types),
        }
    }

    pub fn generate_key_pair(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(ObjectHandle, ObjectHandle), DeviceError> {
        match self {
            #[cfg(feature = "hsm")]
            Provider::Pkcs11(p) => p.generate_key_pair(session, mechanism, public_template, private_template),
            Provider::Builtin(p) => p.generate_key_pair(session, mechanism, public_template, private_template),
        }
    }

    pub fn generate_key(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        template: &[Attribute],
    ) -> Result<ObjectHandle, DeviceError> {
        match self {
            #[cfg(feature = "hsm")]
            Provider::Pkcs11(p) => p.generate_key(session, mechanism, template),
            Provider::Builtin(p) => p.generate_key(session, mechanism, template),
        }
    }

    pub fn destroy_object(&self, session: SessionHandle, object: ObjectHandle) -> Result<(), DeviceError> {
        match self {
            #[cfg(feature = "hsm")]
            Provider::Pkcs11(p) => p.destroy_object(session, object),
            Provider::Builtin(p) => p.destroy_object(session, object),
        }
    }

    pub fn sign(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, DeviceError> {
        match self {
            #[cfg(feature = "hsm")]
            Provider::Pkcs11(p) => p.sign(session, mechanism, key, data),
            Provider::Builtin(p) => p.sign(session, mechanism, key, data),
        }
    }

    pub fn digest(&self, session: SessionHandle, mechanism: Mechanism, data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        match self {
            #[cfg(feature = "hsm")]
            Provider::Pkcs11(p) => p.digest(session, mechanism, data),
            Provider::Builtin(p) => p.digest(session, mechanism, data),
        }
    }

    pub fn generate_random(&self, session: SessionHandle, len: usize) -> Result<Vec<u8>, DeviceError> {
        match self {
            #[cfg(feature = "hsm")]
            Provider::Pkcs11(p) => p.generate_random(session, len),
            Provider::Builtin(p) => p.generate_random(session, len),
        }
    }
}
