//! The command line options for `hsmutil`.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::{error, fmt};

use clap::Parser;
use log::{LevelFilter, warn};

use crate::config::{Config, ConfigError};
use crate::constants::{DEFAULT_DNSKEY_TTL, KASP_HSM_VERSION};
use crate::dns::{Class, DnsError, Name, Record, Rrset, Rtype, SecAlg, Ttl};
use crate::error::HsmError;
use crate::hsm::verify::verify_rrsig;
use crate::hsm::{Context, HsmService, KeyAlgorithm, KeyHandle, KeyInfo, KeyParams, PinCache, PromptPins, SignParams};

use super::report::{
    DnskeyReport, InfoReport, KeyList, RandomBytes, Removed, Report, ReportFormat, RepositoryInfo, TestOutcome,
    TestReport, TestResult,
};


//------------ Options -------------------------------------------------------

/// The command line options for the HSM utility.
#[derive(clap::Parser)]
#[command(
    version,
    about = "Manages the keys of a DNSSEC signer on its HSMs.",
)]
pub struct Options {
    #[command(flatten)]
    pub general: GeneralOptions,

    #[command(subcommand)]
    pub command: Command,
}

impl Options {
    /// Creates the options from the process arguments.
    ///
    /// If the arguments won’t result in usable options, exits the process.
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Attaches the configured repositories and runs the command.
    pub fn run(self) -> Report {
        match self.execute() {
            Ok(report) => report,
            Err(err) => Report::from_error(err),
        }
    }

    fn execute(self) -> Result<Report, Error> {
        let mut config = Config::load(self.general.config.as_deref())?;
        if self.general.verbose {
            config.set_log_level(LevelFilter::Debug);
        }
        config.init_logging()?;

        let credentials = Arc::new(PinCache::new(PromptPins::default()));
        let service = HsmService::from_config(&config, credentials)?;
        let report = match service.create_context() {
            Ok(context) => {
                let report = self.command.run(&service, &context);
                service.destroy_context(context);
                Ok(report)
            }
            Err(err) => Err(err.into()),
        };
        if let Err(err) = service.close() {
            warn!("Error while closing repositories: {}", err);
        }
        report
    }
}


//------------ GeneralOptions ------------------------------------------------

#[derive(clap::Args)]
pub struct GeneralOptions {
    /// Path to the config file.
    #[arg(short, long, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Log debug messages.
    #[arg(short, long)]
    pub verbose: bool,

    /// Report format
    #[arg(
        short, long,
        env = "KASP_HSM_FORMAT",
        default_value = "text",
    )]
    pub format: ReportFormat,
}


//------------ Command -------------------------------------------------------

#[derive(clap::Subcommand)]
pub enum Command {
    /// List the keys of one or all repositories
    List(List),

    /// Generate a key pair
    Generate(Generate),

    /// Remove a key pair. WARNING: Irreversible!
    Remove(Remove),

    /// Show the DNSKEY record of a key
    Dnskey(ShowDnskey),

    /// Generate, sign with and remove a test key for each algorithm
    Test(Test),

    /// Show the attached repositories and check them
    Info(Info),

    /// Produce random bytes with the token of the first repository
    Random(Random),
}

impl Command {
    pub fn run(self, service: &HsmService, context: &Context) -> Report {
        match self {
            Self::List(cmd) => cmd.run(context).into(),
            Self::Generate(cmd) => cmd.run(context).into(),
            Self::Remove(cmd) => cmd.run(context).into(),
            Self::Dnskey(cmd) => cmd.run(context).into(),
            Self::Test(cmd) => cmd.run(context).into(),
            Self::Info(cmd) => cmd.run(service, context).into(),
            Self::Random(cmd) => cmd.run(context).into(),
        }
    }
}


//------------ List ----------------------------------------------------------

#[derive(clap::Args)]
pub struct List {
    /// Only list keys in this repository
    repository: Option<String>,
}

impl List {
    pub fn run(self, context: &Context) -> Result<KeyList, HsmError> {
        let keys = context
            .list_keys(self.repository.as_deref())?
            .iter()
            .map(|key| context.key_info(key))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(KeyList { keys })
    }
}


//------------ Generate ------------------------------------------------------

#[derive(clap::Args)]
pub struct Generate {
    /// The repository to generate the key in
    repository: String,

    /// The algorithm: rsa, dsa, gost, ecdsa or eddsa
    algorithm: String,

    /// The key size in bits, or the curve name for ecdsa and eddsa
    param: Option<String>,
}

impl Generate {
    pub fn run(self, context: &Context) -> Result<KeyInfo, HsmError> {
        let params = KeyParams::parse(&self.algorithm, self.param.as_deref())?;
        let key = context.generate_key(&self.repository, &params)?;
        context.key_info(&key)
    }
}


//------------ Remove --------------------------------------------------------

#[derive(clap::Args)]
pub struct Remove {
    /// The locator of the key
    locator: String,
}

impl Remove {
    pub fn run(self, context: &Context) -> Result<Removed, HsmError> {
        let key = context.find_key_by_id(&self.locator)?;
        context.remove_key(&key)?;
        Ok(Removed { locator: self.locator })
    }
}


//------------ ShowDnskey ----------------------------------------------------

#[derive(clap::Args)]
pub struct ShowDnskey {
    /// The locator of the key
    locator: String,

    /// The owner name of the DNSKEY record
    owner: Name,

    /// The DNSSEC algorithm, by number or mnemonic [default: derived from the key]
    #[arg(short, long)]
    algorithm: Option<SecAlg>,

    /// Set the secure entry point flag
    #[arg(long)]
    ksk: bool,
}

impl ShowDnskey {
    pub fn run(self, context: &Context) -> Result<DnskeyReport, HsmError> {
        let key = context.find_key_by_id(&self.locator)?;
        let algorithm = match self.algorithm {
            Some(algorithm) => algorithm,
            None => default_algorithm(&context.key_info(&key)?)?,
        };
        let params = SignParams::new(algorithm, self.owner).with_ksk(self.ksk);
        let dnskey = context.dnskey(&key, &params)?;
        Ok(DnskeyReport {
            key_tag: dnskey.key_tag(),
            record: Record::new(params.owner, Class::IN, Ttl::from_secs(DEFAULT_DNSKEY_TTL), dnskey).to_string(),
        })
    }
}

/// Picks the DNSSEC algorithm that suits a key best.
fn default_algorithm(info: &KeyInfo) -> Result<SecAlg, HsmError> {
    match (info.algorithm, info.bits) {
        (KeyAlgorithm::Rsa, _) => Ok(SecAlg::RSASHA256),
        (KeyAlgorithm::Dsa, _) => Ok(SecAlg::DSA),
        (KeyAlgorithm::Gost, _) => Ok(SecAlg::ECC_GOST),
        (KeyAlgorithm::Ecdsa, 256) => Ok(SecAlg::ECDSAP256SHA256),
        (KeyAlgorithm::Ecdsa, 384) => Ok(SecAlg::ECDSAP384SHA384),
        (KeyAlgorithm::Eddsa, 255) => Ok(SecAlg::ED25519),
        (KeyAlgorithm::Eddsa, 448) => Ok(SecAlg::ED448),
        (algorithm, bits) => Err(HsmError::invalid_key(format!(
            "no DNSSEC algorithm for {} key of {} bits",
            algorithm, bits
        ))),
    }
}


//------------ Test ----------------------------------------------------------

#[derive(clap::Args)]
pub struct Test {
    /// The repository to test
    repository: String,
}

impl Test {
    pub fn run(self, context: &Context) -> Result<TestReport, HsmError> {
        // Make sure the repository exists before trying anything.
        context.session(&self.repository)?;
        Ok(run_tests(context, &self.repository))
    }
}

/// Runs the signing test for every algorithm against a repository.
pub fn run_tests(context: &Context, repository: &str) -> TestReport {
    let cases = [
        (KeyParams::Rsa { bits: 1024 }, SecAlg::RSAMD5),
        (KeyParams::Rsa { bits: 1024 }, SecAlg::RSASHA1),
        (KeyParams::Rsa { bits: 1024 }, SecAlg::RSASHA1_NSEC3_SHA1),
        (KeyParams::Rsa { bits: 2048 }, SecAlg::RSASHA256),
        (KeyParams::Rsa { bits: 2048 }, SecAlg::RSASHA512),
        (KeyParams::Dsa { bits: 1024 }, SecAlg::DSA),
        (KeyParams::Dsa { bits: 1024 }, SecAlg::DSA_NSEC3_SHA1),
        (KeyParams::Gost, SecAlg::ECC_GOST),
        (KeyParams::Ecdsa { curve: "P-256".into() }, SecAlg::ECDSAP256SHA256),
        (KeyParams::Ecdsa { curve: "P-384".into() }, SecAlg::ECDSAP384SHA384),
        (KeyParams::Eddsa { curve: "edwards25519".into() }, SecAlg::ED25519),
        (KeyParams::Eddsa { curve: "edwards448".into() }, SecAlg::ED448),
    ];
    let results = cases
        .iter()
        .map(|(params, algorithm)| TestResult {
            key: params.to_string(),
            algorithm: algorithm.to_string(),
            outcome: test_algorithm(context, repository, params, *algorithm),
        })
        .collect();
    TestReport {
        repository: repository.to_string(),
        results,
    }
}

fn test_algorithm(context: &Context, repository: &str, params: &KeyParams, algorithm: SecAlg) -> TestOutcome {
    let key = match context.generate_key(repository, params) {
        Ok(key) => key,
        Err(err) => {
            // The latched error is reported through the outcome.
            context.take_error();
            return TestOutcome::Skipped(err.to_string());
        }
    };

    let outcome = match sign_and_verify(context, &key, algorithm) {
        Ok(true) => TestOutcome::Passed,
        Ok(false) => TestOutcome::Failed("signature does not validate".to_string()),
        Err(err) => TestOutcome::Failed(err.to_string()),
    };
    if let Err(err) = context.remove_key(&key) {
        warn!("Could not remove test key: {}", err);
    }
    context.take_error();
    outcome
}

fn sign_and_verify(context: &Context, key: &KeyHandle, algorithm: SecAlg) -> Result<bool, HsmError> {
    let owner = Name::from_str("example.com.").map_err(DnsError::from)?;
    let params = SignParams::new(algorithm, owner.clone());
    let mut rrset = Rrset::new(owner, Class::IN, Rtype::TXT, Ttl::from_secs(3600));
    rrset.push(b"\x0bhello world".to_vec())?;
    let record = context.sign_rrset(&rrset, key, &params)?;
    if algorithm == SecAlg::ECC_GOST {
        // Signed, but there is nothing here to verify GOST signatures with.
        return Ok(true);
    }
    let dnskey = context.dnskey(key, &params)?;
    verify_rrsig(&dnskey, &rrset, record.data())
}


//------------ Info ----------------------------------------------------------

#[derive(clap::Args)]
pub struct Info {}

impl Info {
    pub fn run(self, service: &HsmService, context: &Context) -> Result<InfoReport, HsmError> {
        let repositories = context
            .sessions()
            .iter()
            .map(|session| {
                Ok(RepositoryInfo {
                    name: session.repository().to_string(),
                    token_label: session.token_label().to_string(),
                    provider: session.module().name(),
                    keys: context.count_keys(Some(session.repository()))?,
                })
            })
            .collect::<Result<Vec<_>, HsmError>>()?;
        let check = match service.check() {
            Ok(()) => "ok".to_string(),
            Err(err) => err.to_string(),
        };
        Ok(InfoReport {
            version: KASP_HSM_VERSION.to_string(),
            repositories,
            check,
        })
    }
}


//------------ Random --------------------------------------------------------

#[derive(clap::Args)]
pub struct Random {
    /// The number of bytes
    #[arg(default_value = "16")]
    len: usize,
}

impl Random {
    pub fn run(self, context: &Context) -> Result<RandomBytes, HsmError> {
        let bytes = context.random_buffer(self.len)?;
        Ok(RandomBytes { hex: hex::encode(bytes) })
    }
}


//============ Error Types ===================================================

/// Everything that can go wrong before a command gets to run.
#[derive(Debug)]
pub enum Error {
    Config(ConfigError),
    Hsm(HsmError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "Configuration error: {}", e),
            Error::Hsm(e) => write!(f, "{}", e),
        }
    }
}

impl error::Error for Error {}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl From<HsmError> for Error {
    fn from(e: HsmError) -> Self {
        Error::Hsm(e)
    }
}


//------------ Tests ---------------------------------------------------------
