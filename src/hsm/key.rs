//! Key pairs on tokens: generation, lookup and removal.

use std::fmt;

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::constants::{KEY_ID_LENGTH, MAX_ID_ATTEMPTS, RSA_PUBLIC_EXPONENT};
use crate::error::HsmError;

use super::context::Context;
use super::provider::{Attribute, AttributeType, KeyType, Mechanism, ObjectClass, ObjectHandle, find_attribute, oid};
use super::session::Session;


//------------ KeyHandle -----------------------------------------------------

/// A key pair in a repository.
///
/// The handle refers to token objects, it does not own them. It is only
/// meaningful for contexts that have the repository attached.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyHandle {
    repository: String,
    private: ObjectHandle,
    public: Option<ObjectHandle>,
}

impl KeyHandle {
    pub fn new(repository: &str, private: ObjectHandle, public: Option<ObjectHandle>) -> Self {
        KeyHandle {
            repository: repository.to_string(),
            private,
            public,
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn private(&self) -> ObjectHandle {
        self.private
    }

    /// The public key object, if the repository keeps them.
    pub fn public(&self) -> Option<ObjectHandle> {
        self.public
    }
}


//------------ KeyAlgorithm --------------------------------------------------

/// The algorithm family of a key.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    Rsa,
    Dsa,
    Gost,
    Ecdsa,
    Eddsa,
}

impl KeyAlgorithm {
    pub fn from_key_type(key_type: KeyType) -> Self {
        match key_type {
            KeyType::Rsa => KeyAlgorithm::Rsa,
            KeyType::Dsa => KeyAlgorithm::Dsa,
            KeyType::Gost => KeyAlgorithm::Gost,
            KeyType::Ec => KeyAlgorithm::Ecdsa,
            KeyType::EcEdwards => KeyAlgorithm::Eddsa,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            KeyAlgorithm::Rsa => "RSA",
            KeyAlgorithm::Dsa => "DSA",
            KeyAlgorithm::Gost => "GOST",
            KeyAlgorithm::Ecdsa => "ECDSA",
            KeyAlgorithm::Eddsa => "EDDSA",
        }
    }

    /// The CKK_* value of the key type.
    pub fn code(self) -> u64 {
        match self {
            KeyAlgorithm::Rsa => 0x00,
            KeyAlgorithm::Dsa => 0x01,
            KeyAlgorithm::Ecdsa => 0x03,
            KeyAlgorithm::Gost => 0x30,
            KeyAlgorithm::Eddsa => 0x40,
        }
    }

    /// Whether private key objects carry the public value as well.
    ///
    /// The private objects of DSA and GOST keys hold the secret in
    /// `CKA_VALUE` and nothing the public key could be read from.
    pub fn public_on_private(self) -> bool {
        !matches!(self, KeyAlgorithm::Dsa | KeyAlgorithm::Gost)
    }

    /// The mechanism that signs with keys of this family.
    pub fn sign_mechanism(self) -> Mechanism {
        match self {
            KeyAlgorithm::Rsa => Mechanism::RsaPkcs,
            KeyAlgorithm::Dsa => Mechanism::Dsa,
            KeyAlgorithm::Gost => Mechanism::GostR3410,
            KeyAlgorithm::Ecdsa => Mechanism::Ecdsa,
            KeyAlgorithm::Eddsa => Mechanism::Eddsa,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}


//------------ KeyInfo -------------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct KeyInfo {
    pub repository: String,
    pub locator: String,
    pub algorithm: KeyAlgorithm,
    pub algorithm_code: u64,
    pub algorithm_name: String,
    pub bits: u32,
}


//------------ KeyParams -----------------------------------------------------

/// What key to generate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KeyParams {
    Rsa { bits: u32 },
    Dsa { bits: u32 },
    Gost,

    /// A curve name, `P-256` or `P-384`.
    Ecdsa { curve: String },

    /// A curve name, `edwards25519` or `edwards448`.
    Eddsa { curve: String },
}

impl KeyParams {
    /// Builds parameters from an algorithm family name and a size or curve.
    pub fn parse(family: &str, arg: Option<&str>) -> Result<Self, HsmError> {
        let bits = |arg: Option<&str>| -> Result<u32, HsmError> {
            let arg = arg.ok_or_else(|| HsmError::invalid_argument(format!("{} needs a key size", family)))?;
            arg.parse()
                .map_err(|_| HsmError::invalid_argument(format!("invalid key size '{}'", arg)))
        };
        let curve = |arg: Option<&str>| -> Result<String, HsmError> {
            arg.map(ToString::to_string)
                .ok_or_else(|| HsmError::invalid_argument(format!("{} needs a curve", family)))
        };
        match family.to_ascii_lowercase().as_str() {
            "rsa" => Ok(KeyParams::Rsa { bits: bits(arg)? }),
            "dsa" => Ok(KeyParams::Dsa { bits: bits(arg)? }),
            "gost" => Ok(KeyParams::Gost),
            "ecdsa" => Ok(KeyParams::Ecdsa { curve: curve(arg)? }),
            "eddsa" => Ok(KeyParams::Eddsa { curve: curve(arg)? }),
            _ => Err(HsmError::invalid_argument(format!("unknown algorithm '{}'", family))),
        }
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            KeyParams::Rsa { .. } => KeyAlgorithm::Rsa,
            KeyParams::Dsa { .. } => KeyAlgorithm::Dsa,
            KeyParams::Gost => KeyAlgorithm::Gost,
            KeyParams::Ecdsa { .. } => KeyAlgorithm::Ecdsa,
            KeyParams::Eddsa { .. } => KeyAlgorithm::Eddsa,
        }
    }
}

impl fmt::Display for KeyParams {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyParams::Rsa { bits } => write!(f, "RSA/{}", bits),
            KeyParams::Dsa { bits } => write!(f, "DSA/{}", bits),
            KeyParams::Gost => write!(f, "GOST"),
            KeyParams::Ecdsa { curve } => write!(f, "ECDSA/{}", curve),
            KeyParams::Eddsa { curve } => write!(f, "EDDSA/{}", curve),
        }
    }
}

fn ecdsa_curve(name: &str) -> Option<&'static [u8]> {
    match name {
        "P-256" => Some(oid::P256),
        "P-384" => Some(oid::P384),
        _ => None,
    }
}

fn eddsa_curve(name: &str) -> Option<&'static [u8]> {
    match name {
        "edwards25519" => Some(oid::ED25519),
        "edwards448" => Some(oid::ED448),
        _ => None,
    }
}


//------------ Context: Lookup -----------------------------------------------

impl Context {
    /// Finds a key by its locator in any attached repository.
    ///
    /// Keys found are remembered in the key cache.
    pub fn find_key_by_id(&self, locator: &str) -> Result<KeyHandle, HsmError> {
        let res = self
            .lookup(locator)
            .and_then(|key| key.ok_or_else(|| HsmError::KeyNotFound(locator.to_string())));
        self.latch("find key", res)
    }

    /// Finds a key by its locator in the given repository only.
    pub fn find_key_by_id_in(&self, repository: &str, locator: &str) -> Result<KeyHandle, HsmError> {
        let res = parse_locator(locator).and_then(|id| {
            let session = self.session(repository)?;
            search(session, &id)?.ok_or_else(|| HsmError::KeyNotFound(locator.to_string()))
        });
        self.latch("find key", res)
    }

    /// Looks a key up in the cache and, if missing there, on the tokens.
    fn lookup(&self, locator: &str) -> Result<Option<KeyHandle>, HsmError> {
        if let Some(key) = self.cache().get(locator) {
            return Ok(Some(key));
        }
        // The cache lock is not held while searching, concurrent misses may
        // both search. The first insert wins and everybody gets that key.
        let id = parse_locator(locator)?;
        for session in self.sessions() {
            if let Some(key) = search(session, &id)? {
                return Ok(Some(self.cache().insert(locator, key)));
            }
        }
        Ok(None)
    }

    /// Lists the keys of one or all repositories.
    pub fn list_keys(&self, repository: Option<&str>) -> Result<Vec<KeyHandle>, HsmError> {
        let res = self.collect_keys(repository);
        self.latch("list keys", res)
    }

    pub fn count_keys(&self, repository: Option<&str>) -> Result<usize, HsmError> {
        self.list_keys(repository).map(|keys| keys.len())
    }

    fn collect_keys(&self, repository: Option<&str>) -> Result<Vec<KeyHandle>, HsmError> {
        let sessions = match repository {
            Some(repository) => vec![self.session(repository)?],
            None => self.sessions().iter().collect(),
        };
        let mut res = Vec::new();
        for session in sessions {
            for private in session.find_objects(&[Attribute::Class(ObjectClass::PrivateKey)])? {
                let id = read_id(session, private)?;
                let public = find_object(session, ObjectClass::PublicKey, &id)?;
                res.push(KeyHandle::new(session.repository(), private, public));
            }
        }
        Ok(res)
    }

    /// Returns the locator of a key, its CKA_ID in hex.
    pub fn locator(&self, key: &KeyHandle) -> Result<String, HsmError> {
        let res = self
            .session(key.repository())
            .and_then(|session| read_id(session, key.private()))
            .map(hex::encode);
        self.latch("read key id", res)
    }

    pub fn key_algorithm(&self, key: &KeyHandle) -> Result<KeyAlgorithm, HsmError> {
        let res = self.session(key.repository()).and_then(|session| {
            let attrs = session.get_attributes(key.private(), &[AttributeType::KeyType])?;
            match find_attribute(&attrs, AttributeType::KeyType) {
                Some(Attribute::KeyType(key_type)) => Ok(KeyAlgorithm::from_key_type(*key_type)),
                _ => Err(HsmError::invalid_key("key type unknown")),
            }
        });
        self.latch("read key type", res)
    }

    pub fn key_info(&self, key: &KeyHandle) -> Result<KeyInfo, HsmError> {
        let algorithm = self.key_algorithm(key)?;
        Ok(KeyInfo {
            repository: key.repository().to_string(),
            locator: self.locator(key)?,
            algorithm,
            algorithm_code: algorithm.code(),
            algorithm_name: algorithm.name().to_string(),
            bits: self.key_size(key)?,
        })
    }
}


//------------ Context: Generation and Removal -------------------------------

impl Context {
    pub fn generate_key(&self, repository: &str, params: &KeyParams) -> Result<KeyHandle, HsmError> {
        let res = self.generate(repository, params);
        match &res {
            Ok(_) => info!("Generated {} key in repository '{}'", params, repository),
            Err(err) => warn!("Could not generate {} key in repository '{}': {}", params, repository, err),
        }
        self.latch("generate key", res)
    }

    pub fn generate_rsa_key(&self, repository: &str, bits: u32) -> Result<KeyHandle, HsmError> {
        self.generate_key(repository, &KeyParams::Rsa { bits })
    }

    pub fn generate_dsa_key(&self, repository: &str, bits: u32) -> Result<KeyHandle, HsmError> {
        self.generate_key(repository, &KeyParams::Dsa { bits })
    }

    pub fn generate_gost_key(&self, repository: &str) -> Result<KeyHandle, HsmError> {
        self.generate_key(repository, &KeyParams::Gost)
    }

    pub fn generate_ecdsa_key(&self, repository: &str, curve: &str) -> Result<KeyHandle, HsmError> {
        self.generate_key(
            repository,
            &KeyParams::Ecdsa {
                curve: curve.to_string(),
            },
        )
    }

    pub fn generate_eddsa_key(&self, repository: &str, curve: &str) -> Result<KeyHandle, HsmError> {
        self.generate_key(
            repository,
            &KeyParams::Eddsa {
                curve: curve.to_string(),
            },
        )
    }

    fn generate(&self, repository: &str, params: &KeyParams) -> Result<KeyHandle, HsmError> {
        // Unknown curves are refused before touching the device.
        let curve = match params {
            KeyParams::Ecdsa { curve } => Some(
                ecdsa_curve(curve).ok_or_else(|| HsmError::generation(format!("unknown ECDSA curve '{}'", curve)))?,
            ),
            KeyParams::Eddsa { curve } => Some(
                eddsa_curve(curve).ok_or_else(|| HsmError::generation(format!("unknown EdDSA curve '{}'", curve)))?,
            ),
            _ => None,
        };

        let session = self.session(repository)?;
        let policy = session.policy();
        if policy.skip_public_key && !params.algorithm().public_on_private() {
            return Err(HsmError::generation(format!(
                "repository '{}' does not keep public keys, which {} keys need",
                repository,
                params.algorithm()
            )));
        }
        let id = self.fresh_id(session)?;
        let label = hex::encode(&id).into_bytes();

        let mut public_template = vec![
            Attribute::Token(true),
            Attribute::Private(false),
            Attribute::Verify(true),
            Attribute::Encrypt(false),
            Attribute::Wrap(false),
            Attribute::Id(id.clone()),
            Attribute::Label(label.clone()),
        ];
        let private_template = vec![
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Sign(true),
            Attribute::Decrypt(false),
            Attribute::Unwrap(false),
            Attribute::Extractable(policy.allow_extraction),
            Attribute::Id(id.clone()),
            Attribute::Label(label),
        ];

        let mechanism = match params {
            KeyParams::Rsa { bits } => {
                public_template.push(Attribute::ModulusBits(u64::from(*bits)));
                public_template.push(Attribute::PublicExponent(RSA_PUBLIC_EXPONENT.to_vec()));
                Mechanism::RsaPkcsKeyPairGen
            }
            KeyParams::Dsa { bits } => {
                public_template.extend(dsa_domain_parameters(session, *bits)?);
                Mechanism::DsaKeyPairGen
            }
            KeyParams::Gost => {
                public_template.push(Attribute::GostR3410Params(oid::GOST_R3410_PARAMS.to_vec()));
                public_template.push(Attribute::GostR3411Params(oid::GOST_R3411_PARAMS.to_vec()));
                Mechanism::GostR3410KeyPairGen
            }
            KeyParams::Ecdsa { .. } => {
                public_template.extend(curve.map(|c| Attribute::EcParams(c.to_vec())));
                Mechanism::EcKeyPairGen
            }
            KeyParams::Eddsa { .. } => {
                public_template.extend(curve.map(|c| Attribute::EcParams(c.to_vec())));
                Mechanism::EcEdwardsKeyPairGen
            }
        };

        let (public, private) = session
            .generate_key_pair(mechanism, &public_template, &private_template)
            .map_err(|err| HsmError::generation(format!("{}: {}", params, err)))?;

        let public = if policy.skip_public_key {
            if let Err(err) = session.destroy_object(public) {
                // Don't leave a key behind that nobody knows about.
                if let Err(cleanup) = session.destroy_object(private) {
                    error!(
                        "Could not remove private key {} in repository '{}' after failing to remove its public key: {}",
                        hex::encode(&id),
                        repository,
                        cleanup
                    );
                }
                return Err(err);
            }
            None
        } else {
            Some(public)
        };

        let key = KeyHandle::new(repository, private, public);
        Ok(self.cache().insert(&hex::encode(&id), key))
    }

    /// Returns a random key id that no key in this context uses yet.
    fn fresh_id(&self, session: &Session) -> Result<Vec<u8>, HsmError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = session.generate_random(KEY_ID_LENGTH)?;
            if self.lookup(&hex::encode(&id))?.is_none() {
                return Ok(id);
            }
            debug!("Random key id collides with an existing key, trying again");
        }
        Err(HsmError::generation("could not find an unused key id"))
    }

    /// Destroys a key pair and forgets it in the key cache.
    pub fn remove_key(&self, key: &KeyHandle) -> Result<(), HsmError> {
        let res = self.destroy_key(key);
        self.latch("remove key", res)
    }

    fn destroy_key(&self, key: &KeyHandle) -> Result<(), HsmError> {
        let session = self.session(key.repository())?;
        let locator = hex::encode(read_id(session, key.private())?);
        if let Some(public) = key.public() {
            session.destroy_object(public)?;
        }
        session.destroy_object(key.private())?;
        self.cache().remove(&locator);
        info!("Removed key {} from repository '{}'", locator, key.repository());
        Ok(())
    }
}


//------------ Context: Random Numbers ---------------------------------------

impl Context {
    /// Returns random bytes from the token of the first repository.
    pub fn random_buffer(&self, len: usize) -> Result<Vec<u8>, HsmError> {
        let res = self
            .sessions()
            .first()
            .ok_or(HsmError::NoRepositories)
            .and_then(|session| session.generate_random(len));
        self.latch("generate random", res)
    }

    pub fn random_u32(&self) -> Result<u32, HsmError> {
        let buf = self.random_buffer(4)?;
        Ok(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
    }

    pub fn random_u64(&self) -> Result<u64, HsmError> {
        let buf = self.random_buffer(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buf[..8]);
        Ok(u64::from_be_bytes(bytes))
    }
}


//------------ Helpers -------------------------------------------------------

fn parse_locator(locator: &str) -> Result<Vec<u8>, HsmError> {
    let id = hex::decode(locator).map_err(|_| HsmError::invalid_argument(format!("invalid key locator '{}'", locator)))?;
    if id.is_empty() {
        return Err(HsmError::invalid_argument("empty key locator"));
    }
    Ok(id)
}

/// Searches a repository for the key pair with the given id.
fn search(session: &Session, id: &[u8]) -> Result<Option<KeyHandle>, HsmError> {
    let Some(private) = find_object(session, ObjectClass::PrivateKey, id)? else {
        return Ok(None);
    };
    let public = find_object(session, ObjectClass::PublicKey, id)?;
    Ok(Some(KeyHandle::new(session.repository(), private, public)))
}

fn find_object(session: &Session, class: ObjectClass, id: &[u8]) -> Result<Option<ObjectHandle>, HsmError> {
    let found = session.find_objects(&[Attribute::Class(class), Attribute::Id(id.to_vec())])?;
    if found.len() > 1 {
        warn!(
            "Repository '{}' has {} objects with id {}, using the first",
            session.repository(),
            found.len(),
            hex::encode(id)
        );
    }
    Ok(found.first().copied())
}

fn read_id(session: &Session, object: ObjectHandle) -> Result<Vec<u8>, HsmError> {
    let attrs = session.get_attributes(object, &[AttributeType::Id])?;
    match find_attribute(&attrs, AttributeType::Id) {
        Some(Attribute::Id(id)) => Ok(id.clone()),
        _ => Err(HsmError::invalid_key("key has no id")),
    }
}

/// Generates DSA domain parameters of the given size.
///
/// The parameter object only lives long enough to read the values.
fn dsa_domain_parameters(session: &Session, bits: u32) -> Result<Vec<Attribute>, HsmError> {
    let params = session
        .generate_key(
            Mechanism::DsaParameterGen,
            &[
                Attribute::Class(ObjectClass::DomainParameters),
                Attribute::KeyType(KeyType::Dsa),
                Attribute::PrimeBits(u64::from(bits)),
                Attribute::Token(false),
            ],
        )
        .map_err(|err| HsmError::generation(format!("DSA/{} domain parameters: {}", bits, err)))?;

    let types = [AttributeType::Prime, AttributeType::SubPrime, AttributeType::Base];
    let attrs = session.get_attributes(params, &types);
    if let Err(err) = session.destroy_object(params) {
        warn!("Could not destroy DSA domain parameters: {}", err);
    }
    let attrs = attrs?;
    for attr_type in types {
        if find_attribute(&attrs, attr_type).is_none() {
            return Err(HsmError::generation(format!("DSA domain parameters lack {:?}", attr_type)));
        }
    }
    Ok(attrs)
}


//------------ Tests ---------------------------------------------------------
