//! Attaching repositories and handing out contexts.

use std::io::Write;
use std::sync::{Arc, Barrier};
use std::thread;

use kasp_hsm::config::{Config, RepositoryConfig};
use kasp_hsm::error::HsmError;
use kasp_hsm::hsm::{BuiltinProvider, ConfiguredPins, HsmService};

mod common;


#[test]
fn missing_token_attaches_nothing() {
    let builtin = Arc::new(BuiltinProvider::new().with_token(common::TOKEN, common::PIN));
    let service = HsmService::new(builtin, Arc::new(ConfiguredPins::new()));
    let err = service
        .attach(&[
            RepositoryConfig::builtin("good", common::TOKEN).with_pin(common::PIN),
            RepositoryConfig::builtin("bad", "no-such-token").with_pin(common::PIN),
        ])
        .unwrap_err();
    assert!(matches!(err, HsmError::RepositoryNotFound(_)));
    assert!(service.repositories().is_empty());
    assert!(matches!(service.create_context(), Err(HsmError::NoRepositories)));
}

#[test]
fn wrong_pin_is_reported() {
    let builtin = Arc::new(BuiltinProvider::new().with_token(common::TOKEN, common::PIN));
    let service = HsmService::new(builtin, Arc::new(ConfiguredPins::new()));
    let err = service
        .attach(&[RepositoryConfig::builtin("repo", common::TOKEN).with_pin("4321")])
        .unwrap_err();
    assert!(matches!(err, HsmError::PinIncorrect(_)));
}

#[test]
fn contexts_work_in_parallel() {
    let service = Arc::new(common::service());
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let service = service.clone();
            thread::spawn(move || {
                let ctx = service.create_context().unwrap();
                let key = ctx.generate_ecdsa_key(common::REPOSITORY, "P-256").unwrap();
                let locator = ctx.locator(&key).unwrap();
                service.destroy_context(ctx);
                locator
            })
        })
        .collect();
    let locators: Vec<String> = workers.into_iter().map(|worker| worker.join().unwrap()).collect();

    let ctx = service.create_context().unwrap();
    assert_eq!(ctx.count_keys(None).unwrap(), 4);
    for locator in &locators {
        assert!(ctx.find_key_by_id(locator).is_ok());
    }
    service.destroy_context(ctx);
    service.close().unwrap();
}

#[test]
fn concurrent_lookups_share_one_cached_key() {
    let service = Arc::new(common::service());
    let ctx = service.create_context().unwrap();
    let key = ctx.generate_rsa_key(common::REPOSITORY, 1024).unwrap();
    let locator = ctx.locator(&key).unwrap();
    service.destroy_context(ctx);
    service.cache().clear();

    let barrier = Arc::new(Barrier::new(4));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let service = service.clone();
            let barrier = barrier.clone();
            let locator = locator.clone();
            thread::spawn(move || {
                let ctx = service.create_context().unwrap();
                barrier.wait();
                let found = ctx.find_key_by_id(&locator).unwrap();
                service.destroy_context(ctx);
                found
            })
        })
        .collect();
    let found: Vec<_> = workers.into_iter().map(|worker| worker.join().unwrap()).collect();

    assert_eq!(service.cache().len(), 1);
    let cached = service.cache().get(&locator).unwrap();
    assert!(found.iter().all(|key| *key == cached));
    assert_eq!(cached, key);
    service.close().unwrap();
}

#[test]
fn service_is_built_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(
        br#"
        log_level = "warn"

        [[builtin_token]]
        label = "zone-keys"
        pin = "9999"

        [[repository]]
        name = "zones"
        token_label = "zone-keys"
        pin = "9999"
        skip_public_key = true
        "#,
    )
    .unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    let service = HsmService::from_config(&config, Arc::new(ConfiguredPins::new())).unwrap();
    assert_eq!(service.repositories(), vec!["zones"]);

    let ctx = service.create_context().unwrap();
    let key = ctx.generate_eddsa_key("zones", "edwards25519").unwrap();
    assert!(key.public().is_none());
    assert_eq!(ctx.public_key_rdata(&key).unwrap().len(), 32);
    service.destroy_context(ctx);
}
