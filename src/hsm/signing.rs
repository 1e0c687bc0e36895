//! Signing data and RRsets with keys on a token.

use log::{debug, trace};
use openssl::hash::{MessageDigest, hash};

use crate::constants::{
    DEFAULT_DNSKEY_TTL, DEFAULT_SIGNATURE_VALIDITY, DNSKEY_FLAG_SEP, DNSKEY_FLAG_ZONE, HSM_MAX_SIGNATURE_LENGTH,
};
use crate::dns::{self, Class, Dnskey, Name, ProtoRrsig, Record, Rrset, Rrsig, SecAlg, Timestamp, ToName, Ttl};
use crate::error::HsmError;

use super::context::Context;
use super::key::{KeyAlgorithm, KeyHandle};
use super::provider::{AttributeType, Mechanism, find_bytes};
use super::rdata::strip_leading_zeros;


//------------ SignParams ----------------------------------------------------

/// How to sign something, and with which DNSKEY to associate it.
#[derive(Clone, Debug, PartialEq)]
pub struct SignParams {
    pub algorithm: SecAlg,

    /// The DNSKEY flags of the key.
    pub flags: u16,

    /// Defaults to now.
    pub inception: Option<Timestamp>,

    /// Defaults to four weeks after inception.
    pub expiration: Option<Timestamp>,

    /// The key tag to use instead of the one calculated from the key.
    pub keytag: Option<u16>,

    /// The owner of the DNSKEY, i.e., the signer name of signatures.
    pub owner: Name,
}

impl SignParams {
    /// Creates parameters for a zone signing key.
    pub fn new(algorithm: SecAlg, owner: Name) -> Self {
        SignParams {
            algorithm,
            flags: DNSKEY_FLAG_ZONE,
            inception: None,
            expiration: None,
            keytag: None,
            owner,
        }
    }

    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    /// Sets or clears the secure entry point flag.
    pub fn with_ksk(mut self, ksk: bool) -> Self {
        if ksk {
            self.flags |= DNSKEY_FLAG_SEP;
        } else {
            self.flags &= !DNSKEY_FLAG_SEP;
        }
        self
    }

    pub fn with_inception(mut self, inception: Timestamp) -> Self {
        self.inception = Some(inception);
        self
    }

    pub fn with_expiration(mut self, expiration: Timestamp) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_keytag(mut self, keytag: u16) -> Self {
        self.keytag = Some(keytag);
        self
    }
}


//------------ AlgorithmProfile ----------------------------------------------

/// Where the digest to sign comes from.
#[derive(Clone, Copy)]
enum Digest {
    /// The data is signed as is.
    None,

    /// Calculated here.
    Host(MessageDigest),

    /// Calculated by the token.
    Device(Mechanism),
}

/// How data is prepared for signing with a DNSSEC algorithm.
#[derive(Clone, Copy)]
struct AlgorithmProfile {
    family: KeyAlgorithm,
    digest: Digest,

    /// The DER encoded DigestInfo header for RSA PKCS #1 v1.5 signatures.
    prefix: &'static [u8],
}

const MD5_PREFIX: &[u8] = &[
    0x30, 0x20, 0x30, 0x0c, 0x06, 0x08, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x02, 0x05, 0x05, 0x00, 0x04, 0x10,
];

const SHA1_PREFIX: &[u8] = &[
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14,
];

const SHA256_PREFIX: &[u8] = &[
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01, 0x05, 0x00, 0x04, 0x20,
];

const SHA512_PREFIX: &[u8] = &[
    0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03, 0x05, 0x00, 0x04, 0x40,
];

impl AlgorithmProfile {
    fn new(family: KeyAlgorithm, digest: Digest, prefix: &'static [u8]) -> Self {
        AlgorithmProfile { family, digest, prefix }
    }

    fn for_algorithm(algorithm: SecAlg) -> Result<Self, HsmError> {
        use KeyAlgorithm::*;

        let res = match algorithm {
            SecAlg::RSAMD5 => Self::new(Rsa, Digest::Device(Mechanism::Md5), MD5_PREFIX),
            SecAlg::DSA | SecAlg::DSA_NSEC3_SHA1 => Self::new(Dsa, Digest::Host(MessageDigest::sha1()), &[]),
            SecAlg::RSASHA1 | SecAlg::RSASHA1_NSEC3_SHA1 => {
                Self::new(Rsa, Digest::Host(MessageDigest::sha1()), SHA1_PREFIX)
            }
            SecAlg::RSASHA256 => Self::new(Rsa, Digest::Host(MessageDigest::sha256()), SHA256_PREFIX),
            SecAlg::RSASHA512 => Self::new(Rsa, Digest::Host(MessageDigest::sha512()), SHA512_PREFIX),
            SecAlg::ECC_GOST => Self::new(Gost, Digest::Device(Mechanism::GostR3411), &[]),
            SecAlg::ECDSAP256SHA256 => Self::new(Ecdsa, Digest::Host(MessageDigest::sha256()), &[]),
            SecAlg::ECDSAP384SHA384 => Self::new(Ecdsa, Digest::Host(MessageDigest::sha384()), &[]),
            SecAlg::ED25519 | SecAlg::ED448 => Self::new(Eddsa, Digest::None, &[]),
            _ => {
                return Err(HsmError::invalid_argument(format!(
                    "unsupported DNSSEC algorithm {}",
                    algorithm
                )))
            }
        };
        Ok(res)
    }
}

/// Returns the key family a DNSSEC algorithm signs with.
pub fn algorithm_family(algorithm: SecAlg) -> Result<KeyAlgorithm, HsmError> {
    AlgorithmProfile::for_algorithm(algorithm).map(|profile| profile.family)
}


//------------ Context: Signing ----------------------------------------------

impl Context {
    /// Signs data with a key.
    ///
    /// Digests the data as the algorithm requires and returns the signature
    /// in DNSSEC wire format.
    pub fn sign_buffer(&self, key: &KeyHandle, algorithm: SecAlg, data: &[u8]) -> Result<Vec<u8>, HsmError> {
        let res = self.sign_data(key, algorithm, data);
        self.latch("sign", res)
    }

    fn sign_data(&self, key: &KeyHandle, algorithm: SecAlg, data: &[u8]) -> Result<Vec<u8>, HsmError> {
        let profile = AlgorithmProfile::for_algorithm(algorithm)?;
        self.check_family(key, algorithm, profile.family)?;
        let session = self.session(key.repository())?;

        let digest = match profile.digest {
            Digest::None => data.to_vec(),
            Digest::Host(md) => hash(md, data)
                .map_err(|err| HsmError::signing(format!("digest failed: {}", err)))?
                .to_vec(),
            Digest::Device(mechanism) => session
                .digest(mechanism, data)
                .map_err(|err| HsmError::signing(format!("digest failed: {}", err)))?,
        };

        let mut input = Vec::with_capacity(profile.prefix.len() + digest.len());
        input.extend_from_slice(profile.prefix);
        input.extend_from_slice(&digest);

        trace!(
            "Signing {} bytes with {} key in repository '{}'",
            input.len(),
            profile.family,
            key.repository()
        );
        let signature = session
            .sign(profile.family.sign_mechanism(), key.private(), &input)
            .map_err(|err| HsmError::signing(format!("{} signature failed: {}", algorithm, err)))?;
        if signature.len() > HSM_MAX_SIGNATURE_LENGTH {
            return Err(HsmError::signing(format!(
                "signature of {} bytes exceeds the maximum of {}",
                signature.len(),
                HSM_MAX_SIGNATURE_LENGTH
            )));
        }

        match profile.family {
            KeyAlgorithm::Dsa => self.dsa_signature(key, signature),
            _ => Ok(signature),
        }
    }

    /// Converts a raw `r|s` DSA signature into the RFC 2536 format.
    fn dsa_signature(&self, key: &KeyHandle, signature: Vec<u8>) -> Result<Vec<u8>, HsmError> {
        if signature.len() != 40 {
            return Err(HsmError::signing(format!(
                "DSA signature has {} bytes, expected 40",
                signature.len()
            )));
        }
        let prime = self.dsa_prime(key)?;
        let p_len = strip_leading_zeros(&prime).len();
        if !(64..=128).contains(&p_len) || (p_len - 64) % 8 != 0 {
            return Err(HsmError::signing(format!("unsupported DSA prime of {} bytes", p_len)));
        }
        let mut res = Vec::with_capacity(41);
        res.push(((p_len - 64) / 8) as u8);
        res.extend_from_slice(&signature);
        Ok(res)
    }

    /// Reads the DSA prime from the private key or else the public one.
    fn dsa_prime(&self, key: &KeyHandle) -> Result<Vec<u8>, HsmError> {
        let session = self.session(key.repository())?;
        for object in std::iter::once(key.private()).chain(key.public()) {
            let attrs = session.get_attributes(object, &[AttributeType::Prime])?;
            if let Some(prime) = find_bytes(&attrs, AttributeType::Prime) {
                return Ok(prime.to_vec());
            }
        }
        Err(HsmError::invalid_key("DSA key without prime"))
    }

    fn check_family(&self, key: &KeyHandle, algorithm: SecAlg, family: KeyAlgorithm) -> Result<(), HsmError> {
        let actual = self.key_algorithm(key)?;
        if actual != family {
            return Err(HsmError::invalid_argument(format!(
                "cannot use {} key with algorithm {}",
                actual, algorithm
            )));
        }
        Ok(())
    }

    /// Signs an RRset and returns the RRSIG record.
    pub fn sign_rrset(&self, rrset: &Rrset, key: &KeyHandle, params: &SignParams) -> Result<Record<Rrsig>, HsmError> {
        let res = self.make_rrsig(rrset, key, params);
        self.latch("sign RRset", res)
    }

    fn make_rrsig(&self, rrset: &Rrset, key: &KeyHandle, params: &SignParams) -> Result<Record<Rrsig>, HsmError> {
        if rrset.is_empty() {
            return Err(HsmError::invalid_argument("cannot sign an empty RRset"));
        }

        let inception = params.inception.unwrap_or_else(Timestamp::now);
        let expiration = params
            .expiration
            .unwrap_or_else(|| Timestamp::from(inception.into_int().wrapping_add(DEFAULT_SIGNATURE_VALIDITY)));
        let key_tag = match params.keytag {
            Some(key_tag) => key_tag,
            None => self.dnskey(key, params)?.key_tag(),
        };

        let head = ProtoRrsig::new(
            rrset.rtype(),
            params.algorithm,
            rrset.owner().rrsig_label_count(),
            rrset.ttl(),
            expiration,
            inception,
            key_tag,
            params.owner.clone(),
        );
        let signature = self.sign_data(key, params.algorithm, &dns::signed_data(&head, rrset, rrset.ttl()))?;
        let rrsig = head.into_rrsig(signature).map_err(dns::DnsError::from)?;

        debug!(
            "Signed {} {} with key tag {}",
            rrset.owner(),
            rrset.rtype(),
            key_tag
        );
        Ok(Record::new(rrset.owner().clone(), rrset.class(), rrset.ttl(), rrsig))
    }

    /// Returns the DNSKEY of a key.
    pub fn dnskey(&self, key: &KeyHandle, params: &SignParams) -> Result<Dnskey, HsmError> {
        let res = algorithm_family(params.algorithm)
            .and_then(|family| self.check_family(key, params.algorithm, family))
            .and_then(|_| self.public_key_rdata(key))
            .and_then(|public_key| dns::dnskey(params.flags, params.algorithm, public_key).map_err(HsmError::from));
        self.latch("get DNSKEY", res)
    }

    /// Returns the DNSKEY record of a key, owned by `params.owner`.
    pub fn get_dnskey(&self, key: &KeyHandle, params: &SignParams) -> Result<Record<Dnskey>, HsmError> {
        self.dnskey(key, params).map(|dnskey| {
            Record::new(params.owner.clone(), Class::IN, Ttl::from_secs(DEFAULT_DNSKEY_TTL), dnskey)
        })
    }

    /// Calculates the key tag the key with the given locator would have.
    pub fn keytag(&self, locator: &str, algorithm: SecAlg, ksk: bool) -> Result<u16, HsmError> {
        let key = self.find_key_by_id(locator)?;
        let params = SignParams::new(algorithm, Name::root_vec()).with_ksk(ksk);
        self.dnskey(&key, &params).map(|dnskey| dnskey.key_tag())
    }
}


//------------ Tests ---------------------------------------------------------
