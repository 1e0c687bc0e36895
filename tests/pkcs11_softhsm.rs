//! Tests against a SoftHSM token.
//!
//! Needs an initialised token, e.g.:
//!
//! ```text
//! softhsm2-util --init-token --free --label kasp-test --pin 1234 --so-pin 1234
//! ```
//!
//! The library is taken from `SOFTHSM2_MODULE` and defaults to the Debian
//! location. `KASP_TEST_TOKEN` and `KASP_TEST_PIN` override the token label
//! and PIN shown above.
#![cfg(feature = "hsm-tests-pkcs11")]

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use kasp_hsm::config::RepositoryConfig;
use kasp_hsm::dns::SecAlg;
use kasp_hsm::hsm::{BuiltinProvider, ConfiguredPins, HsmService, SignParams, verify_rrsig};

mod common;

fn softhsm() -> HsmService {
    let module = env::var_os("SOFTHSM2_MODULE")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/usr/lib/softhsm/libsofthsm2.so"));
    let label = env::var("KASP_TEST_TOKEN").unwrap_or_else(|_| "kasp-test".to_string());
    let pin = env::var("KASP_TEST_PIN").unwrap_or_else(|_| "1234".to_string());
    let service = HsmService::new(Arc::new(BuiltinProvider::new()), Arc::new(ConfiguredPins::new()));
    service
        .attach(&[RepositoryConfig::pkcs11("softhsm", module, &label).with_pin(&pin)])
        .unwrap();
    service
}

#[test]
fn softhsm_signs_and_validates() {
    common::init_logging();
    let service = softhsm();
    let ctx = service.create_context().unwrap();
    for (key, algorithm) in [
        (ctx.generate_rsa_key("softhsm", 2048).unwrap(), SecAlg::RSASHA256),
        (ctx.generate_rsa_key("softhsm", 1024).unwrap(), SecAlg::RSAMD5),
        (ctx.generate_dsa_key("softhsm", 1024).unwrap(), SecAlg::DSA),
        (ctx.generate_dsa_key("softhsm", 1024).unwrap(), SecAlg::DSA_NSEC3_SHA1),
        (ctx.generate_ecdsa_key("softhsm", "P-256").unwrap(), SecAlg::ECDSAP256SHA256),
    ] {
        let params = SignParams::new(algorithm, common::name("example.com."));
        let rrset = common::a_rrset("example.com.");
        let record = ctx.sign_rrset(&rrset, &key, &params).unwrap();
        let dnskey = ctx.dnskey(&key, &params).unwrap();
        assert!(verify_rrsig(&dnskey, &rrset, record.data()).unwrap(), "{}", algorithm);

        let locator = ctx.locator(&key).unwrap();
        service.cache().clear();
        assert_eq!(ctx.find_key_by_id(&locator).unwrap(), key);
        ctx.remove_key(&key).unwrap();
    }
    service.destroy_context(ctx);
    service.close().unwrap();
}

/// SoftHSM only offers GOST when built against an OpenSSL with the GOST
/// engine. Signing is checked only where the token can make the key.
#[test]
fn softhsm_gost_when_available() {
    common::init_logging();
    let service = softhsm();
    let ctx = service.create_context().unwrap();
    let key = match ctx.generate_gost_key("softhsm") {
        Ok(key) => key,
        Err(_) => {
            service.destroy_context(ctx);
            return;
        }
    };
    let params = SignParams::new(SecAlg::ECC_GOST, common::name("example.com."));
    let record = ctx
        .sign_rrset(&common::a_rrset("example.com."), &key, &params)
        .unwrap();
    assert_eq!(record.data().signature().len(), 64);
    assert_eq!(ctx.dnskey(&key, &params).unwrap().public_key().len(), 64);
    ctx.remove_key(&key).unwrap();
    service.destroy_context(ctx);
    service.close().unwrap();
}
