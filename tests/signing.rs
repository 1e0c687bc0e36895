//! Signing RRsets on the built-in token and validating the result.

use kasp_hsm::dns::{self, Rtype, SecAlg, Timestamp, Ttl};
use kasp_hsm::hsm::{KeyParams, SignParams, verify_rrsig};

mod common;


#[test]
fn signatures_validate_for_all_algorithms() {
    let (_service, ctx) = common::context();
    let cases = [
        (KeyParams::Rsa { bits: 1024 }, SecAlg::RSAMD5),
        (KeyParams::Rsa { bits: 1024 }, SecAlg::RSASHA1),
        (KeyParams::Rsa { bits: 1024 }, SecAlg::RSASHA1_NSEC3_SHA1),
        (KeyParams::Rsa { bits: 2048 }, SecAlg::RSASHA256),
        (KeyParams::Rsa { bits: 2048 }, SecAlg::RSASHA512),
        (KeyParams::Dsa { bits: 1024 }, SecAlg::DSA),
        (KeyParams::Dsa { bits: 1024 }, SecAlg::DSA_NSEC3_SHA1),
        (KeyParams::Ecdsa { curve: "P-256".into() }, SecAlg::ECDSAP256SHA256),
        (KeyParams::Ecdsa { curve: "P-384".into() }, SecAlg::ECDSAP384SHA384),
        (KeyParams::Eddsa { curve: "edwards25519".into() }, SecAlg::ED25519),
        (KeyParams::Eddsa { curve: "edwards448".into() }, SecAlg::ED448),
    ];
    let rrset = common::a_rrset("www.example.com.");
    for (key_params, algorithm) in cases {
        let key = ctx.generate_key(common::REPOSITORY, &key_params).unwrap();
        let params = SignParams::new(algorithm, common::name("example.com."));
        let record = ctx.sign_rrset(&rrset, &key, &params).unwrap();
        assert_eq!(record.rtype(), Rtype::RRSIG);
        assert_eq!(record.owner(), rrset.owner());

        // What goes on the wire parses back to the same signature.
        let rrsig = dns::parse_rrsig(&dns::to_rdata(record.data())).unwrap();
        assert_eq!(&rrsig, record.data());

        let dnskey = ctx.dnskey(&key, &params).unwrap();
        assert_eq!(rrsig.key_tag(), dnskey.key_tag());
        assert_eq!(rrsig.labels(), 3);
        assert!(
            verify_rrsig(&dnskey, &rrset, &rrsig).unwrap(),
            "{} with {}",
            key_params,
            algorithm
        );
    }
}

#[test]
fn tampered_signature_does_not_validate() {
    let (_service, ctx) = common::context();
    let key = ctx.generate_ecdsa_key(common::REPOSITORY, "P-256").unwrap();
    let params = SignParams::new(SecAlg::ECDSAP256SHA256, common::name("example.com."));
    let rrset = common::a_rrset("example.com.");
    let record = ctx.sign_rrset(&rrset, &key, &params).unwrap();
    let dnskey = ctx.dnskey(&key, &params).unwrap();

    let mut rrsig = record.data().clone();
    let mut signature = rrsig.signature().clone();
    signature[10] ^= 0x01;
    rrsig.set_signature(signature);
    assert!(!verify_rrsig(&dnskey, &rrset, &rrsig).unwrap());

    // Changing the data invalidates the original signature as well.
    let other = common::a_rrset("www.example.com.");
    assert!(!verify_rrsig(&dnskey, &other, record.data()).unwrap());
}

#[test]
fn ksk_dnskey_and_keytag_agree() {
    let (_service, ctx) = common::context();
    let key = ctx.generate_rsa_key(common::REPOSITORY, 2048).unwrap();
    let locator = ctx.locator(&key).unwrap();

    let params = SignParams::new(SecAlg::RSASHA256, common::name("example.com.")).with_ksk(true);
    let record = ctx.get_dnskey(&key, &params).unwrap();
    assert_eq!(record.rtype(), Rtype::DNSKEY);
    assert_eq!(record.owner(), &common::name("example.com."));
    assert_eq!(record.ttl(), Ttl::from_secs(3600));

    let dnskey = record.data();
    assert_eq!(dnskey.flags(), 257);
    assert_eq!(dnskey.protocol(), 3);
    assert_eq!(dnskey.algorithm(), SecAlg::RSASHA256);
    assert!(dnskey.is_secure_entry_point());
    assert_eq!(ctx.keytag(&locator, SecAlg::RSASHA256, true).unwrap(), dnskey.key_tag());
    assert_ne!(ctx.keytag(&locator, SecAlg::RSASHA256, false).unwrap(), dnskey.key_tag());
}

#[test]
fn explicit_validity_is_used() {
    let (_service, ctx) = common::context();
    let key = ctx.generate_eddsa_key(common::REPOSITORY, "edwards25519").unwrap();
    let params = SignParams::new(SecAlg::ED25519, common::name("example.com."))
        .with_inception(Timestamp::from(1_700_000_000))
        .with_expiration(Timestamp::from(1_700_086_400))
        .with_keytag(4711);
    let record = ctx.sign_rrset(&common::a_rrset("example.com."), &key, &params).unwrap();
    let rrsig = record.data();
    assert_eq!(rrsig.inception().into_int(), 1_700_000_000);
    assert_eq!(rrsig.expiration().into_int(), 1_700_086_400);
    assert_eq!(rrsig.key_tag(), 4711);
    assert_eq!(rrsig.signature().len(), 64);
}

#[test]
fn unsupported_algorithm_is_refused() {
    let (_service, ctx) = common::context();
    let key = ctx.generate_rsa_key(common::REPOSITORY, 1024).unwrap();
    let params = SignParams::new(SecAlg::DH, common::name("example.com."));
    assert!(ctx.sign_rrset(&common::a_rrset("example.com."), &key, &params).is_err());
    assert!(ctx.take_error().is_some());
}
