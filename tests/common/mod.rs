#![allow(dead_code)] // Different tests use different parts.

use std::str::FromStr;
use std::sync::Arc;

use kasp_hsm::config::RepositoryConfig;
use kasp_hsm::dns::{Class, Name, Rrset, Rtype, Ttl};
use kasp_hsm::hsm::{BuiltinProvider, ConfiguredPins, Context, HsmService};

pub const TOKEN: &str = "test-token";
pub const PIN: &str = "1234";
pub const REPOSITORY: &str = "test";


//------------ Setup ---------------------------------------------------------

/// Logs to stderr if `KASP_TEST_LOG` is set. Safe to call more than once.
pub fn init_logging() {
    if std::env::var_os("KASP_TEST_LOG").is_some() {
        let _ = stderrlog::new().verbosity(3).init();
    }
}

/// Returns a service with one repository on a fresh built-in token.
pub fn service() -> HsmService {
    init_logging();
    let builtin = Arc::new(BuiltinProvider::new().with_token(TOKEN, PIN));
    let service = HsmService::new(builtin, Arc::new(ConfiguredPins::new()));
    service
        .attach(&[RepositoryConfig::builtin(REPOSITORY, TOKEN).with_pin(PIN)])
        .unwrap();
    service
}

/// Returns a service together with a worker context.
pub fn context() -> (HsmService, Context) {
    let service = service();
    let context = service.create_context().unwrap();
    (service, context)
}

pub fn name(s: &str) -> Name {
    Name::from_str(s).unwrap()
}

/// An A RRset with two addresses.
pub fn a_rrset(owner: &str) -> Rrset {
    let mut rrset = Rrset::new(name(owner), Class::IN, Rtype::A, Ttl::from_secs(3600));
    rrset.push(vec![192, 0, 2, 2]).unwrap();
    rrset.push(vec![192, 0, 2, 1]).unwrap();
    rrset
}
