//! The DNS data this crate consumes and produces.
//!
//! Names, the IANA registries, and the DNSKEY and RRSIG record data are
//! those of the `domain` crate. What is added here is the RRset that gets
//! signed: record data of one owner, class and type, put into canonical
//! order. RDATA of other types is carried as opaque bytes and must already
//! be in canonical form (RFC 4034, section 6.2) when handed to us.

use std::cmp::Ordering;
use std::fmt;

use domain::base::cmp::CanonicalOrd;
use domain::base::name;
use domain::base::rdata::{ComposeRecordData, LongRecordData, UnknownRecordData};
use domain::base::wire::ParseError;
use domain::dep::octseq::builder::infallible;
use domain::dep::octseq::parse::Parser;

pub use domain::base::iana::{Class, Rtype, SecAlg};
pub use domain::base::name::ToName;
pub use domain::base::Ttl;
pub use domain::rdata::dnssec::Timestamp;

use crate::constants::DNSKEY_PROTOCOL;


//------------ Type Aliases --------------------------------------------------

/// An absolute domain name.
pub type Name = domain::base::Name<Vec<u8>>;

/// Record data of a type we don’t need to look into.
pub type Rdata = UnknownRecordData<Vec<u8>>;

/// A record owned by an absolute name.
pub type Record<Data = Rdata> = domain::base::Record<Name, Data>;

pub type Dnskey = domain::rdata::Dnskey<Vec<u8>>;

pub type Rrsig = domain::rdata::Rrsig<Vec<u8>, Name>;

/// The RRSIG record data without the signature.
pub type ProtoRrsig = domain::rdata::dnssec::ProtoRrsig<Name>;


//------------ DnsError ------------------------------------------------------

#[derive(Clone, Debug)]
pub enum DnsError {
    BadName(name::FromStrError),
    LongRecordData,
    Parse(ParseError),
    EmptyRrset,
    RrsetMismatch(String),
}

impl fmt::Display for DnsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DnsError::BadName(err) => write!(f, "invalid domain name: {}", err),
            DnsError::LongRecordData => write!(f, "record data exceeds 65535 octets"),
            DnsError::Parse(err) => write!(f, "malformed record data: {}", err),
            DnsError::EmptyRrset => write!(f, "empty RRset"),
            DnsError::RrsetMismatch(msg) => write!(f, "records do not form an RRset: {}", msg),
        }
    }
}

impl std::error::Error for DnsError {}

impl From<name::FromStrError> for DnsError {
    fn from(e: name::FromStrError) -> Self {
        DnsError::BadName(e)
    }
}

impl From<LongRecordData> for DnsError {
    fn from(_: LongRecordData) -> Self {
        DnsError::LongRecordData
    }
}

impl From<ParseError> for DnsError {
    fn from(e: ParseError) -> Self {
        DnsError::Parse(e)
    }
}


//------------ Rrset ---------------------------------------------------------

/// A set of records sharing owner, class and type.
#[derive(Clone, Debug)]
pub struct Rrset {
    owner: Name,
    class: Class,
    rtype: Rtype,
    ttl: Ttl,
    rdata: Vec<Rdata>,
}

impl Rrset {
    pub fn new(owner: Name, class: Class, rtype: Rtype, ttl: Ttl) -> Self {
        Rrset {
            owner,
            class,
            rtype,
            ttl,
            rdata: Vec::new(),
        }
    }

    /// Collects records into a set.
    ///
    /// All records must share owner, class and type. The TTL of the set is
    /// the lowest TTL of its records.
    pub fn from_records(records: &[Record]) -> Result<Self, DnsError> {
        let first = records.first().ok_or(DnsError::EmptyRrset)?;
        let mut rrset = Rrset::new(first.owner().clone(), first.class(), first.rtype(), first.ttl());
        for record in records {
            if *record.owner() != rrset.owner {
                return Err(DnsError::RrsetMismatch(format!("owner {} differs", record.owner())));
            }
            if record.class() != rrset.class {
                return Err(DnsError::RrsetMismatch(format!("class {} differs", record.class())));
            }
            if record.rtype() != rrset.rtype {
                return Err(DnsError::RrsetMismatch(format!("type {} differs", record.rtype())));
            }
            rrset.ttl = rrset.ttl.min(record.ttl());
            rrset.rdata.push(record.data().clone());
        }
        Ok(rrset)
    }

    /// Adds the wire format record data of one record.
    pub fn push(&mut self, rdata: Vec<u8>) -> Result<(), DnsError> {
        self.rdata.push(Rdata::from_octets(self.rtype, rdata)?);
        Ok(())
    }

    pub fn owner(&self) -> &Name {
        &self.owner
    }

    pub fn class(&self) -> Class {
        self.class
    }

    pub fn rtype(&self) -> Rtype {
        self.rtype
    }

    pub fn ttl(&self) -> Ttl {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.rdata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rdata.is_empty()
    }

    /// The record data in canonical order with duplicates removed.
    pub fn canonical_rdata(&self) -> Vec<&Rdata> {
        let mut res: Vec<&Rdata> = self.rdata.iter().collect();
        res.sort_by(|l, r| l.canonical_cmp(*r));
        res.dedup_by(|l, r| l.canonical_cmp(*r) == Ordering::Equal);
        res
    }

    /// Appends the canonical wire form of the set as input to a signature.
    pub fn compose_canonical(&self, original_ttl: Ttl, target: &mut Vec<u8>) {
        for data in self.canonical_rdata() {
            let record = domain::base::Record::new(&self.owner, self.class, original_ttl, data);
            infallible(record.compose_canonical(target));
        }
    }
}


//------------ Signing Input -------------------------------------------------

/// Returns the data an RRSIG signs: its own head and the canonical RRset.
pub fn signed_data(head: &ProtoRrsig, rrset: &Rrset, original_ttl: Ttl) -> Vec<u8> {
    let mut res = Vec::new();
    infallible(head.compose_canonical(&mut res));
    rrset.compose_canonical(original_ttl, &mut res);
    res
}

/// Strips the signature off RRSIG record data.
pub fn rrsig_head(rrsig: &Rrsig) -> ProtoRrsig {
    ProtoRrsig::new(
        rrsig.type_covered(),
        rrsig.algorithm(),
        rrsig.labels(),
        rrsig.original_ttl(),
        rrsig.expiration(),
        rrsig.inception(),
        rrsig.key_tag(),
        rrsig.signer_name().clone(),
    )
}


//------------ Record Data ---------------------------------------------------

/// Creates DNSKEY record data for the DNSSEC protocol.
pub fn dnskey(flags: u16, algorithm: SecAlg, public_key: Vec<u8>) -> Result<Dnskey, DnsError> {
    Dnskey::new(flags, DNSKEY_PROTOCOL, algorithm, public_key).map_err(Into::into)
}

/// Returns the wire format of record data.
pub fn to_rdata<Data: ComposeRecordData>(data: &Data) -> Vec<u8> {
    let mut res = Vec::new();
    infallible(data.compose_rdata(&mut res));
    res
}

/// Parses DNSKEY record data from its wire format.
pub fn parse_dnskey(data: &[u8]) -> Result<Dnskey, DnsError> {
    let mut parser = Parser::from_ref(data);
    let parsed = domain::rdata::Dnskey::parse(&mut parser)?;
    Dnskey::new(parsed.flags(), parsed.protocol(), parsed.algorithm(), parsed.public_key().to_vec())
        .map_err(Into::into)
}

/// Parses RRSIG record data from its wire format.
pub fn parse_rrsig(data: &[u8]) -> Result<Rrsig, DnsError> {
    let mut parser = Parser::from_ref(data);
    let parsed = domain::rdata::Rrsig::parse(&mut parser)?;
    Rrsig::new(
        parsed.type_covered(),
        parsed.algorithm(),
        parsed.labels(),
        parsed.original_ttl(),
        parsed.expiration(),
        parsed.inception(),
        parsed.key_tag(),
        parsed.signer_name().to_vec(),
        parsed.signature().to_vec(),
    )
    .map_err(Into::into)
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;

    use super::*;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    #[test]
    fn should_not_count_wildcard_label() {
        assert_eq!(name("*.example.com.").rrsig_label_count(), 2);
        assert_eq!(name("www.example.com.").rrsig_label_count(), 3);
        assert_eq!(Name::root_vec().rrsig_label_count(), 0);
    }

    #[test]
    fn should_parse_algorithms() {
        assert_eq!(SecAlg::from_str("8").unwrap(), SecAlg::RSASHA256);
        assert_eq!(SecAlg::from_str("ecdsap256sha256").unwrap(), SecAlg::ECDSAP256SHA256);
        assert_eq!(SecAlg::from_str("DSA-NSEC3-SHA1").unwrap(), SecAlg::DSA_NSEC3_SHA1);
        assert!(SecAlg::from_str("RSASHA384").is_err());
    }

    #[test]
    fn should_order_and_dedup_rrset() {
        let mut rrset = Rrset::new(name("example."), Class::IN, Rtype::A, Ttl::from_secs(300));
        rrset.push(vec![192, 0, 2, 2]).unwrap();
        rrset.push(vec![192, 0, 2, 1]).unwrap();
        rrset.push(vec![192, 0, 2, 2]).unwrap();
        let ordered: Vec<&[u8]> = rrset.canonical_rdata().iter().map(|data| data.data().as_slice()).collect();
        assert_eq!(ordered, vec![&[192u8, 0, 2, 1][..], &[192u8, 0, 2, 2][..]]);

        let mut buf = Vec::new();
        rrset.compose_canonical(Ttl::from_secs(300), &mut buf);
        assert_eq!(buf.len(), 2 * (9 + 2 + 2 + 4 + 2 + 4));
        assert_eq!(&buf[..9], b"\x07example\x00");
    }

    #[test]
    fn should_lower_case_owner_in_signed_data() {
        let mut rrset = Rrset::new(name("WWW.Example."), Class::IN, Rtype::A, Ttl::from_secs(300));
        rrset.push(vec![192, 0, 2, 1]).unwrap();
        let mut buf = Vec::new();
        rrset.compose_canonical(Ttl::from_secs(60), &mut buf);
        assert_eq!(&buf[..13], b"\x03www\x07example\x00");
        assert_eq!(&buf[17..21], &60u32.to_be_bytes());
    }

    #[test]
    fn should_refuse_oversized_rdata() {
        let mut rrset = Rrset::new(name("example."), Class::IN, Rtype::TXT, Ttl::from_secs(300));
        assert!(matches!(rrset.push(vec![0; 65536]), Err(DnsError::LongRecordData)));
        assert!(rrset.is_empty());
        rrset.push(vec![0; 65535]).unwrap();
        assert_eq!(rrset.len(), 1);
    }

    #[test]
    fn should_reject_mixed_records() {
        let data = Rdata::from_octets(Rtype::A, vec![192, 0, 2, 1]).unwrap();
        let a = Record::new(name("a.example."), Class::IN, Ttl::from_secs(300), data.clone());
        let b = Record::new(name("b.example."), Class::IN, Ttl::from_secs(300), data.clone());
        assert!(matches!(Rrset::from_records(&[a.clone(), b]), Err(DnsError::RrsetMismatch(_))));
        assert!(matches!(Rrset::from_records(&[]), Err(DnsError::EmptyRrset)));

        let lower = Record::new(name("a.example."), Class::IN, Ttl::from_secs(60), data);
        assert_eq!(Rrset::from_records(&[a, lower]).unwrap().ttl(), Ttl::from_secs(60));
    }

    #[test]
    fn should_calculate_key_tag() {
        // The DNSKEY from RFC 4034, section 5.4, has key tag 60485.
        let key = BASE64
            .decode(
                "AQOeiiR0GOMYkDshWoSKz9XzfwJr1AYtsmx3TGkJaNXVbfi/2pHm822aJ5iI9BMzNXxeYCmZ\
                 DRD99WYwYqUSdjMmmAphXdvxegXd/M5+X7OrzKBaMbCVdFLUUh6DhweJBjEVv5f2wwjM9Xzc\
                 nOf+EPbtG9DMBmADjFDc2w/rljwvFw==",
            )
            .unwrap();
        let dnskey = dnskey(256, SecAlg::RSASHA1, key).unwrap();
        assert_eq!(dnskey.key_tag(), 60485);
        assert_eq!(parse_dnskey(&to_rdata(&dnskey)).unwrap(), dnskey);
    }

    #[test]
    fn should_use_modulus_bits_for_rsamd5_key_tag() {
        let dnskey = dnskey(256, SecAlg::RSAMD5, vec![1, 3, 0xaa, 0xbb, 0x12, 0x34, 0xcc]).unwrap();
        assert_eq!(dnskey.key_tag(), 0x1234);
    }

    #[test]
    fn should_parse_rrsig_rdata() {
        let rrsig = Rrsig::new(
            Rtype::A,
            SecAlg::RSASHA256,
            2,
            Ttl::from_secs(3600),
            Timestamp::from(1_700_086_400),
            Timestamp::from(1_700_000_000),
            12345,
            name("example.com."),
            vec![1, 2, 3, 4],
        )
        .unwrap();
        let parsed = parse_rrsig(&to_rdata(&rrsig)).unwrap();
        assert_eq!(parsed, rrsig);
        assert_eq!(parsed.signer_name(), &name("example.com."));
        assert!(matches!(parse_rrsig(&[0, 1, 8]), Err(DnsError::Parse(_))));
    }
}
