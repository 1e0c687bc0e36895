//! Public key material in the form DNSKEY records carry it.
//!
//! The encodings follow RFC 3110 for RSA, RFC 2536 for DSA, RFC 5933 for
//! GOST, RFC 6605 for ECDSA and RFC 8080 for EdDSA.

use crate::constants::GOST_KEY_SIZE;
use crate::error::{EncodingError, HsmError};

use super::context::Context;
use super::key::{KeyAlgorithm, KeyHandle};
use super::provider::{Attribute, AttributeType, find_bytes};


//------------ PublicMaterial ------------------------------------------------

/// The public half of a key pair as read from the token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PublicMaterial {
    Rsa { exponent: Vec<u8>, modulus: Vec<u8> },
    Dsa { prime: Vec<u8>, subprime: Vec<u8>, base: Vec<u8>, value: Vec<u8> },
    Gost(Vec<u8>),

    /// The EC point as the token reports it, DER wrapped.
    Ecdsa(Vec<u8>),

    /// The EdDSA point as the token reports it, DER wrapped.
    Eddsa(Vec<u8>),
}

impl PublicMaterial {
    /// The attributes needed to build the material of the algorithm.
    pub fn attribute_types(algorithm: KeyAlgorithm) -> &'static [AttributeType] {
        match algorithm {
            KeyAlgorithm::Rsa => &[AttributeType::PublicExponent, AttributeType::Modulus],
            KeyAlgorithm::Dsa => &[
                AttributeType::Prime,
                AttributeType::SubPrime,
                AttributeType::Base,
                AttributeType::Value,
            ],
            KeyAlgorithm::Gost => &[AttributeType::Value],
            KeyAlgorithm::Ecdsa | KeyAlgorithm::Eddsa => &[AttributeType::EcPoint],
        }
    }

    pub fn from_attributes(algorithm: KeyAlgorithm, attrs: &[Attribute]) -> Result<Self, EncodingError> {
        let get = |attr_type, name| {
            find_bytes(attrs, attr_type)
                .filter(|v| !v.is_empty())
                .map(<[u8]>::to_vec)
                .ok_or(EncodingError::MissingComponent(name))
        };
        let res = match algorithm {
            KeyAlgorithm::Rsa => PublicMaterial::Rsa {
                exponent: get(AttributeType::PublicExponent, "public exponent")?,
                modulus: get(AttributeType::Modulus, "modulus")?,
            },
            KeyAlgorithm::Dsa => PublicMaterial::Dsa {
                prime: get(AttributeType::Prime, "prime")?,
                subprime: get(AttributeType::SubPrime, "subprime")?,
                base: get(AttributeType::Base, "base")?,
                value: get(AttributeType::Value, "value")?,
            },
            KeyAlgorithm::Gost => PublicMaterial::Gost(get(AttributeType::Value, "value")?),
            KeyAlgorithm::Ecdsa => PublicMaterial::Ecdsa(get(AttributeType::EcPoint, "EC point")?),
            KeyAlgorithm::Eddsa => PublicMaterial::Eddsa(get(AttributeType::EcPoint, "EC point")?),
        };
        Ok(res)
    }

    /// Encodes the material as the public key field of a DNSKEY record.
    pub fn rdata(&self) -> Result<Vec<u8>, EncodingError> {
        match self {
            PublicMaterial::Rsa { exponent, modulus } => encode_rsa(exponent, modulus),
            PublicMaterial::Dsa {
                prime,
                subprime,
                base,
                value,
            } => encode_dsa(prime, subprime, base, value),
            PublicMaterial::Gost(value) => Ok(value.clone()),
            PublicMaterial::Ecdsa(point) => decode_der_point(point, true),
            PublicMaterial::Eddsa(point) => decode_der_point(point, false),
        }
    }

    /// The size of the key in bits.
    pub fn bits(&self) -> Result<u32, EncodingError> {
        match self {
            PublicMaterial::Rsa { modulus, .. } => Ok(bit_length(modulus)),
            PublicMaterial::Dsa { prime, .. } => Ok(bit_length(prime)),
            PublicMaterial::Gost(_) => Ok(GOST_KEY_SIZE),
            PublicMaterial::Ecdsa(point) => Ok(ecdsa_bits(decode_der_point(point, true)?.len())),
            PublicMaterial::Eddsa(point) => eddsa_bits(decode_der_point(point, false)?.len()),
        }
    }
}


//------------ Encoding ------------------------------------------------------

pub fn strip_leading_zeros(data: &[u8]) -> &[u8] {
    let start = data.iter().position(|b| *b != 0).unwrap_or(data.len());
    &data[start..]
}

/// Encodes an RSA public key per RFC 3110.
///
/// Exponents longer than 255 bytes are refused.
pub fn encode_rsa(exponent: &[u8], modulus: &[u8]) -> Result<Vec<u8>, EncodingError> {
    let exponent = strip_leading_zeros(exponent);
    let modulus = strip_leading_zeros(modulus);
    if exponent.is_empty() {
        return Err(EncodingError::MissingComponent("public exponent"));
    }
    if modulus.is_empty() {
        return Err(EncodingError::MissingComponent("modulus"));
    }
    if exponent.len() > 255 {
        return Err(EncodingError::ExponentTooLong(exponent.len()));
    }
    let mut res = Vec::with_capacity(1 + exponent.len() + modulus.len());
    res.push(exponent.len() as u8);
    res.extend_from_slice(exponent);
    res.extend_from_slice(modulus);
    Ok(res)
}

/// Splits RFC 3110 data into exponent and modulus.
///
/// Also accepts the three byte length form.
pub fn decode_rsa(data: &[u8]) -> Result<(&[u8], &[u8]), EncodingError> {
    let (len, start) = match data.first() {
        None => return Err(EncodingError::ShortBuffer { needed: 1, available: 0 }),
        Some(0) => {
            if data.len() < 3 {
                return Err(EncodingError::ShortBuffer {
                    needed: 3,
                    available: data.len(),
                });
            }
            (usize::from(u16::from_be_bytes([data[1], data[2]])), 3)
        }
        Some(len) => (usize::from(*len), 1),
    };
    if data.len() <= start + len {
        return Err(EncodingError::ShortBuffer {
            needed: start + len + 1,
            available: data.len(),
        });
    }
    Ok((&data[start..start + len], &data[start + len..]))
}

/// Encodes a DSA public key per RFC 2536.
pub fn encode_dsa(prime: &[u8], subprime: &[u8], base: &[u8], value: &[u8]) -> Result<Vec<u8>, EncodingError> {
    let prime = strip_leading_zeros(prime);
    let p_len = prime.len();
    if !(64..=128).contains(&p_len) || (p_len - 64) % 8 != 0 {
        return Err(EncodingError::InvalidDsaParameters(format!(
            "prime of {} bytes",
            p_len
        )));
    }
    let t = ((p_len - 64) / 8) as u8;

    let mut res = Vec::with_capacity(1 + 20 + 3 * p_len);
    res.push(t);
    push_padded(&mut res, subprime, 20, "subprime")?;
    res.extend_from_slice(prime);
    push_padded(&mut res, base, p_len, "base")?;
    push_padded(&mut res, value, p_len, "value")?;
    Ok(res)
}

fn push_padded(target: &mut Vec<u8>, value: &[u8], len: usize, name: &str) -> Result<(), EncodingError> {
    let value = strip_leading_zeros(value);
    if value.len() > len {
        return Err(EncodingError::InvalidDsaParameters(format!(
            "{} of {} bytes, expected at most {}",
            name,
            value.len(),
            len
        )));
    }
    target.resize(target.len() + len - value.len(), 0);
    target.extend_from_slice(value);
    Ok(())
}

/// Unwraps an EC point from its DER OCTET STRING.
///
/// For ECDSA the point must be uncompressed and the marker byte is dropped,
/// leaving `X | Y`. For EdDSA the content is returned as is.
pub fn decode_der_point(der: &[u8], ecdsa: bool) -> Result<Vec<u8>, EncodingError> {
    if der.len() < 2 {
        return Err(EncodingError::ShortBuffer {
            needed: 2,
            available: der.len(),
        });
    }
    if der[0] != 0x04 {
        return Err(EncodingError::WrongTag(der[0]));
    }

    let (len, header) = match der[1] {
        0x80 => return Err(EncodingError::IndefiniteLength),
        len if len < 0x80 => (usize::from(len), 2),
        len => {
            let octets = usize::from(len & 0x7f);
            if der.len() < 2 + octets {
                return Err(EncodingError::ShortBuffer {
                    needed: 2 + octets,
                    available: der.len(),
                });
            }
            let mut value: usize = 0;
            for octet in &der[2..2 + octets] {
                value = value
                    .checked_mul(256)
                    .map(|v| v + usize::from(*octet))
                    .ok_or(EncodingError::LengthMismatch {
                        expected: usize::MAX,
                        actual: der.len() - 2 - octets,
                    })?;
            }
            (value, 2 + octets)
        }
    };

    let content = &der[header..];
    if content.len() != len {
        return Err(EncodingError::LengthMismatch {
            expected: len,
            actual: content.len(),
        });
    }

    if !ecdsa {
        return Ok(content.to_vec());
    }
    match content.first() {
        None => Err(EncodingError::ShortBuffer {
            needed: header + 1,
            available: der.len(),
        }),
        Some(0x02) | Some(0x03) => Err(EncodingError::CompressedPoint),
        Some(0x04) => Ok(content[1..].to_vec()),
        Some(marker) => Err(EncodingError::MissingUncompressedMarker(*marker)),
    }
}


//------------ Key Sizes -----------------------------------------------------

/// The number of significant bits in a big-endian integer.
pub fn bit_length(data: &[u8]) -> u32 {
    let data = strip_leading_zeros(data);
    match data.first() {
        None => 0,
        Some(first) => (data.len() as u32 - 1) * 8 + (8 - first.leading_zeros()),
    }
}

/// The curve size for an ECDSA point of the given length without marker.
pub fn ecdsa_bits(point_len: usize) -> u32 {
    (point_len / 2 * 8) as u32
}

/// The curve size for an EdDSA point of the given length.
pub fn eddsa_bits(point_len: usize) -> Result<u32, EncodingError> {
    match point_len {
        32 => Ok(255),
        57 => Ok(448),
        len => Err(EncodingError::InvalidEddsaLength(len)),
    }
}


//------------ Context -------------------------------------------------------

impl Context {
    /// Reads the public material of a key.
    ///
    /// Uses the public key object if there is one, otherwise the private key
    /// object of key families that carry the public value there.
    pub fn public_material(&self, key: &KeyHandle) -> Result<PublicMaterial, HsmError> {
        let res = self.read_public_material(key);
        self.latch("read public key", res)
    }

    fn read_public_material(&self, key: &KeyHandle) -> Result<PublicMaterial, HsmError> {
        let algorithm = self.key_algorithm(key)?;
        let session = self.session(key.repository())?;
        let object = match key.public() {
            Some(public) => public,
            None if algorithm.public_on_private() => key.private(),
            None => return Err(HsmError::invalid_key(format!("{} key without public key object", algorithm))),
        };
        let attrs = session.get_attributes(object, PublicMaterial::attribute_types(algorithm))?;
        Ok(PublicMaterial::from_attributes(algorithm, &attrs)?)
    }

    /// Returns the public key field of the DNSKEY record for a key.
    pub fn public_key_rdata(&self, key: &KeyHandle) -> Result<Vec<u8>, HsmError> {
        let res = self
            .read_public_material(key)
            .and_then(|material| material.rdata().map_err(HsmError::from));
        self.latch("encode public key", res)
    }

    /// Returns the size of a key in bits.
    pub fn key_size(&self, key: &KeyHandle) -> Result<u32, HsmError> {
        let res = self
            .read_public_material(key)
            .and_then(|material| material.bits().map_err(HsmError::from));
        self.latch("determine key size", res)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_encode_rsa_with_short_exponent() {
        let rdata = encode_rsa(&[0x00, 0x01, 0x00, 0x01], &[0x00, 0xc0, 0xff, 0xee]).unwrap();
        assert_eq!(rdata, vec![0x03, 0x01, 0x00, 0x01, 0xc0, 0xff, 0xee]);
        let (exponent, modulus) = decode_rsa(&rdata).unwrap();
        assert_eq!(exponent, &[0x01, 0x00, 0x01]);
        assert_eq!(modulus, &[0xc0, 0xff, 0xee]);
    }

    #[test]
    fn should_reject_long_exponent() {
        let exponent = vec![0x01; 256];
        assert_eq!(
            encode_rsa(&exponent, &[0xc0]),
            Err(EncodingError::ExponentTooLong(256))
        );
        assert!(encode_rsa(&vec![0x01; 255], &[0xc0]).is_ok());
    }

    #[test]
    fn should_reject_missing_rsa_components() {
        assert_eq!(
            encode_rsa(&[0x00], &[0xc0]),
            Err(EncodingError::MissingComponent("public exponent"))
        );
        assert_eq!(
            encode_rsa(&[0x03], &[]),
            Err(EncodingError::MissingComponent("modulus"))
        );
    }

    #[test]
    fn should_decode_three_byte_exponent_length() {
        let mut data = vec![0x00, 0x01, 0x00];
        data.extend(vec![0x01; 256]);
        data.extend([0xc0, 0xff]);
        let (exponent, modulus) = decode_rsa(&data).unwrap();
        assert_eq!(exponent.len(), 256);
        assert_eq!(modulus, &[0xc0, 0xff]);
    }

    #[test]
    fn should_encode_dsa() {
        let prime = vec![0xff; 64];
        let rdata = encode_dsa(&prime, &[0x01; 20], &[0x02; 63], &[0x03; 64]).unwrap();
        assert_eq!(rdata.len(), 1 + 20 + 3 * 64);
        assert_eq!(rdata[0], 0);
        assert_eq!(&rdata[1..21], &[0x01; 20]);
        assert_eq!(rdata[21 + 64], 0x00);
        assert_eq!(rdata[21 + 65], 0x02);

        let prime = vec![0xff; 128];
        assert_eq!(encode_dsa(&prime, &[0x01; 20], &[0x02], &[0x03]).unwrap()[0], 8);
    }

    #[test]
    fn should_reject_bad_dsa_parameters() {
        assert!(matches!(
            encode_dsa(&[0xff; 65], &[0x01; 20], &[0x02], &[0x03]),
            Err(EncodingError::InvalidDsaParameters(_))
        ));
        assert!(matches!(
            encode_dsa(&[0xff; 64], &[0x01; 21], &[0x02], &[0x03]),
            Err(EncodingError::InvalidDsaParameters(_))
        ));
    }

    fn p256_point() -> Vec<u8> {
        let mut der = vec![0x04, 0x41, 0x04];
        der.extend((0..64).map(|i| i as u8));
        der
    }

    #[test]
    fn should_decode_uncompressed_point() {
        let xy = decode_der_point(&p256_point(), true).unwrap();
        assert_eq!(xy.len(), 64);
        assert_eq!(xy[0], 0);
        assert_eq!(ecdsa_bits(xy.len()), 256);
    }

    #[test]
    fn should_decode_long_form_length() {
        let mut der = vec![0x04, 0x81, 0x61, 0x04];
        der.extend(vec![0x11; 96]);
        let xy = decode_der_point(&der, true).unwrap();
        assert_eq!(ecdsa_bits(xy.len()), 384);
    }

    #[test]
    fn should_reject_short_point_buffer() {
        assert_eq!(
            decode_der_point(&[0x04], true),
            Err(EncodingError::ShortBuffer { needed: 2, available: 1 })
        );
    }

    #[test]
    fn should_reject_wrong_tag() {
        let mut der = p256_point();
        der[0] = 0x03;
        assert_eq!(decode_der_point(&der, true), Err(EncodingError::WrongTag(0x03)));
    }

    #[test]
    fn should_reject_indefinite_length() {
        let der = [0x04, 0x80, 0x04, 0x01, 0x02, 0x00, 0x00];
        assert_eq!(decode_der_point(&der, true), Err(EncodingError::IndefiniteLength));
    }

    #[test]
    fn should_reject_compressed_point() {
        let mut der = vec![0x04, 0x21, 0x02];
        der.extend(vec![0x11; 32]);
        assert_eq!(decode_der_point(&der, true), Err(EncodingError::CompressedPoint));

        // EdDSA points have no marker to look at.
        assert_eq!(decode_der_point(&der, false).unwrap().len(), 33);
    }

    #[test]
    fn should_reject_length_mismatch() {
        let mut der = p256_point();
        der.pop();
        assert_eq!(
            decode_der_point(&der, true),
            Err(EncodingError::LengthMismatch { expected: 65, actual: 64 })
        );
    }

    #[test]
    fn should_map_eddsa_sizes() {
        assert_eq!(eddsa_bits(32), Ok(255));
        assert_eq!(eddsa_bits(57), Ok(448));
        assert_eq!(eddsa_bits(33), Err(EncodingError::InvalidEddsaLength(33)));
    }

    #[test]
    fn should_count_significant_bits() {
        assert_eq!(bit_length(&[]), 0);
        assert_eq!(bit_length(&[0x00, 0x00]), 0);
        assert_eq!(bit_length(&[0x01]), 1);
        assert_eq!(bit_length(&[0x00, 0x80, 0x00]), 16);
        assert_eq!(bit_length(&[0x7f, 0xff]), 15);
    }

    #[test]
    fn should_build_material_from_attributes() {
        let attrs = vec![
            Attribute::Modulus(vec![0x00, 0xc0, 0x01]),
            Attribute::PublicExponent(vec![0x03]),
        ];
        let material = PublicMaterial::from_attributes(KeyAlgorithm::Rsa, &attrs).unwrap();
        assert_eq!(material.bits().unwrap(), 16);
        assert_eq!(material.rdata().unwrap(), vec![0x01, 0x03, 0xc0, 0x01]);

        assert_eq!(
            PublicMaterial::from_attributes(KeyAlgorithm::Dsa, &attrs),
            Err(EncodingError::MissingComponent("prime"))
        );
        assert_eq!(
            PublicMaterial::Gost(vec![0x01; 64]).bits().unwrap(),
            GOST_KEY_SIZE
        );
    }
}
