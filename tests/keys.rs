//! Generating, finding and removing keys on the built-in token.

use std::collections::HashSet;

use kasp_hsm::error::HsmError;
use kasp_hsm::hsm::{KeyAlgorithm, KeyParams};

mod common;


#[test]
fn generated_keys_have_requested_size() {
    let (_service, ctx) = common::context();
    let cases = [
        (KeyParams::Rsa { bits: 1024 }, KeyAlgorithm::Rsa, 1024),
        (KeyParams::Rsa { bits: 2048 }, KeyAlgorithm::Rsa, 2048),
        (KeyParams::Dsa { bits: 1024 }, KeyAlgorithm::Dsa, 1024),
        (KeyParams::Ecdsa { curve: "P-256".into() }, KeyAlgorithm::Ecdsa, 256),
        (KeyParams::Ecdsa { curve: "P-384".into() }, KeyAlgorithm::Ecdsa, 384),
        (KeyParams::Eddsa { curve: "edwards25519".into() }, KeyAlgorithm::Eddsa, 255),
        (KeyParams::Eddsa { curve: "edwards448".into() }, KeyAlgorithm::Eddsa, 448),
    ];
    for (params, algorithm, bits) in cases {
        let key = ctx.generate_key(common::REPOSITORY, &params).unwrap();
        assert_eq!(ctx.key_size(&key).unwrap(), bits, "{}", params);
        assert_eq!(ctx.key_algorithm(&key).unwrap(), algorithm, "{}", params);
    }
    assert_eq!(ctx.count_keys(Some(common::REPOSITORY)).unwrap(), 7);
}

#[test]
fn keys_are_found_by_locator() {
    let (service, ctx) = common::context();
    let key = ctx.generate_rsa_key(common::REPOSITORY, 1024).unwrap();
    let locator = ctx.locator(&key).unwrap();
    assert_eq!(locator.len(), 32);

    assert_eq!(ctx.find_key_by_id(&locator).unwrap(), key);

    // Without the cache the token is searched, with the same result.
    service.cache().clear();
    assert_eq!(ctx.find_key_by_id(&locator).unwrap(), key);
    assert_eq!(ctx.find_key_by_id(&locator).unwrap(), key);
    assert_eq!(ctx.find_key_by_id_in(common::REPOSITORY, &locator).unwrap(), key);
}

#[test]
fn locators_are_unique() {
    let (_service, ctx) = common::context();
    let locators: HashSet<String> = (0..20)
        .map(|_| {
            let key = ctx.generate_ecdsa_key(common::REPOSITORY, "P-256").unwrap();
            ctx.locator(&key).unwrap()
        })
        .collect();
    assert_eq!(locators.len(), 20);
}

#[test]
fn removed_keys_are_gone() {
    let (_service, ctx) = common::context();
    let key = ctx.generate_eddsa_key(common::REPOSITORY, "edwards25519").unwrap();
    let locator = ctx.locator(&key).unwrap();
    ctx.remove_key(&key).unwrap();

    assert!(matches!(ctx.find_key_by_id(&locator), Err(HsmError::KeyNotFound(_))));
    assert_eq!(ctx.count_keys(None).unwrap(), 0);

    // The failed lookup is latched on the context.
    let latched = ctx.take_error().unwrap();
    assert_eq!(latched.action, "find key");
    assert!(ctx.take_error().is_none());
}

#[test]
fn unknown_repository_is_refused() {
    let (_service, ctx) = common::context();
    assert!(matches!(
        ctx.generate_rsa_key("nope", 1024),
        Err(HsmError::RepositoryNotFound(name)) if name == "nope"
    ));
    assert!(ctx.list_keys(Some("nope")).is_err());
}
