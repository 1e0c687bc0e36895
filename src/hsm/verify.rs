//! Verifying DNSSEC signatures in software.
//!
//! This does not involve any token. It is used to check that what a token
//! signed can be validated with the DNSKEY we publish for it.

use openssl::bn::{BigNum, BigNumContext};
use openssl::dsa::{Dsa, DsaSig};
use openssl::ec::{EcGroup, EcKey, EcPoint};
use openssl::ecdsa::EcdsaSig;
use openssl::hash::{MessageDigest, hash};
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey};
use openssl::rsa::Rsa;
use openssl::sign::Verifier;

use crate::dns::{self, Dnskey, Rrset, Rrsig, SecAlg};
use crate::error::{EncodingError, HsmError};

use super::rdata::decode_rsa;


/// Verifies a signature over `data` made by the key in `public_key`.
///
/// The public key and the signature are expected in the DNSSEC wire
/// formats of the algorithm. Returns whether the signature is valid.
pub fn verify_signature(
    algorithm: SecAlg,
    public_key: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<bool, HsmError> {
    match algorithm {
        SecAlg::RSAMD5 => verify_rsa(MessageDigest::md5(), public_key, data, signature),
        SecAlg::RSASHA1 | SecAlg::RSASHA1_NSEC3_SHA1 => verify_rsa(MessageDigest::sha1(), public_key, data, signature),
        SecAlg::RSASHA256 => verify_rsa(MessageDigest::sha256(), public_key, data, signature),
        SecAlg::RSASHA512 => verify_rsa(MessageDigest::sha512(), public_key, data, signature),
        SecAlg::DSA | SecAlg::DSA_NSEC3_SHA1 => verify_dsa(public_key, data, signature),
        SecAlg::ECDSAP256SHA256 => verify_ecdsa(Nid::X9_62_PRIME256V1, MessageDigest::sha256(), public_key, data, signature),
        SecAlg::ECDSAP384SHA384 => verify_ecdsa(Nid::SECP384R1, MessageDigest::sha384(), public_key, data, signature),
        SecAlg::ED25519 => verify_eddsa(Id::ED25519, public_key, data, signature),
        SecAlg::ED448 => verify_eddsa(Id::ED448, public_key, data, signature),
        _ => Err(HsmError::invalid_argument(format!("cannot verify {} signatures", algorithm))),
    }
}

/// Verifies an RRSIG over an RRset with the given DNSKEY.
pub fn verify_rrsig(dnskey: &Dnskey, rrset: &Rrset, rrsig: &Rrsig) -> Result<bool, HsmError> {
    if dnskey.algorithm() != rrsig.algorithm() {
        return Ok(false);
    }
    let wire = dns::signed_data(&dns::rrsig_head(rrsig), rrset, rrsig.original_ttl());
    verify_signature(rrsig.algorithm(), dnskey.public_key(), &wire, rrsig.signature())
}

fn verify_rsa(md: MessageDigest, public_key: &[u8], data: &[u8], signature: &[u8]) -> Result<bool, HsmError> {
    let (exponent, modulus) = decode_rsa(public_key)?;
    let rsa = Rsa::from_public_components(BigNum::from_slice(modulus)?, BigNum::from_slice(exponent)?)?;
    let pkey = PKey::from_rsa(rsa)?;
    let mut verifier = Verifier::new(md, &pkey)?;
    verifier.update(data)?;
    Ok(verifier.verify(signature).unwrap_or(false))
}

/// Verifies an RFC 2536 DSA signature.
fn verify_dsa(public_key: &[u8], data: &[u8], signature: &[u8]) -> Result<bool, HsmError> {
    let t = *public_key.first().ok_or(EncodingError::ShortBuffer {
        needed: 1,
        available: 0,
    })? as usize;
    if t > 8 {
        return Err(EncodingError::InvalidDsaParameters(format!("T of {} is out of range", t)).into());
    }
    let len = 64 + t * 8;
    let needed = 1 + 20 + 3 * len;
    if public_key.len() != needed {
        return Err(EncodingError::LengthMismatch {
            expected: needed,
            actual: public_key.len(),
        }
        .into());
    }
    if signature.len() != 41 {
        return Ok(false);
    }

    let q = &public_key[1..21];
    let p = &public_key[21..21 + len];
    let g = &public_key[21 + len..21 + 2 * len];
    let y = &public_key[21 + 2 * len..];
    let dsa = Dsa::from_public_components(
        BigNum::from_slice(p)?,
        BigNum::from_slice(q)?,
        BigNum::from_slice(g)?,
        BigNum::from_slice(y)?,
    )?;
    let pkey = PKey::from_dsa(dsa)?;

    let sig = DsaSig::from_private_components(
        BigNum::from_slice(&signature[1..21])?,
        BigNum::from_slice(&signature[21..41])?,
    )?;
    let mut verifier = Verifier::new(MessageDigest::sha1(), &pkey)?;
    verifier.update(data)?;
    Ok(verifier.verify(&sig.to_der()?).unwrap_or(false))
}

/// Verifies a raw `r|s` ECDSA signature.
fn verify_ecdsa(
    curve: Nid,
    md: MessageDigest,
    public_key: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<bool, HsmError> {
    let group = EcGroup::from_curve_name(curve)?;
    let field_len = (group.degree() as usize).div_ceil(8);
    if public_key.len() != 2 * field_len {
        return Err(EncodingError::LengthMismatch {
            expected: 2 * field_len,
            actual: public_key.len(),
        }
        .into());
    }
    if signature.len() != 2 * field_len {
        return Ok(false);
    }

    let mut encoded = Vec::with_capacity(1 + public_key.len());
    encoded.push(0x04);
    encoded.extend_from_slice(public_key);
    let mut ctx = BigNumContext::new()?;
    let point = EcPoint::from_bytes(&group, &encoded, &mut ctx)?;
    let key = EcKey::from_public_key(&group, &point)?;

    let sig = EcdsaSig::from_private_components(
        BigNum::from_slice(&signature[..field_len])?,
        BigNum::from_slice(&signature[field_len..])?,
    )?;
    let digest = hash(md, data)?;
    Ok(sig.verify(&digest, &key).unwrap_or(false))
}

fn verify_eddsa(id: Id, public_key: &[u8], data: &[u8], signature: &[u8]) -> Result<bool, HsmError> {
    let pkey = PKey::public_key_from_raw_bytes(public_key, id)?;
    let mut verifier = Verifier::new_without_digest(&pkey)?;
    Ok(verifier.verify_oneshot(signature, data).unwrap_or(false))
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use openssl::pkey::Private;
    use openssl::sign::Signer;

    use super::*;
    use crate::hsm::rdata::encode_rsa;

    fn rsa_key() -> (PKey<Private>, Vec<u8>) {
        let rsa = Rsa::generate(1024).unwrap();
        let rdata = encode_rsa(&rsa.e().to_vec(), &rsa.n().to_vec()).unwrap();
        (PKey::from_rsa(rsa).unwrap(), rdata)
    }

    #[test]
    fn should_verify_rsa_signature() {
        let (pkey, rdata) = rsa_key();
        let mut signer = Signer::new(MessageDigest::sha256(), &pkey).unwrap();
        signer.update(b"data").unwrap();
        let signature = signer.sign_to_vec().unwrap();

        assert!(verify_signature(SecAlg::RSASHA256, &rdata, b"data", &signature).unwrap());
        assert!(!verify_signature(SecAlg::RSASHA256, &rdata, b"dato", &signature).unwrap());
        assert!(!verify_signature(SecAlg::RSASHA512, &rdata, b"data", &signature).unwrap());
    }

    #[test]
    fn should_verify_ed25519_signature() {
        let pkey = PKey::generate_ed25519().unwrap();
        let public = pkey.raw_public_key().unwrap();
        let mut signer = Signer::new_without_digest(&pkey).unwrap();
        let signature = signer.sign_oneshot_to_vec(b"data").unwrap();

        assert!(verify_signature(SecAlg::ED25519, &public, b"data", &signature).unwrap());
        assert!(!verify_signature(SecAlg::ED25519, &public, b"Data", &signature).unwrap());
    }

    #[test]
    fn should_reject_malformed_keys() {
        assert!(verify_signature(SecAlg::ECDSAP256SHA256, &[0; 63], b"data", &[0; 64]).is_err());
        assert!(verify_signature(SecAlg::DSA, &[], b"data", &[0; 41]).is_err());
        assert!(verify_signature(SecAlg::DSA, &[9], b"data", &[0; 41]).is_err());
        assert!(verify_signature(SecAlg::ECC_GOST, &[0; 64], b"data", &[0; 64]).is_err());
    }
}
