//! Configuration of repositories, the built-in provider and logging.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, fmt, io};

use log::{LevelFilter, error, info};
use secrecy::{ExposeSecret, SecretString};
use serde::de;
use serde::{Deserialize, Deserializer};
#[cfg(unix)]
use syslog::Facility;

use crate::constants::*;


//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    /// The log level used when the config file does not set one.
    ///
    /// Taken from the environment if set there.
    fn log_level() -> Result<LevelFilter, ConfigError> {
        Self::level_from_env(env::var(KASP_HSM_ENV_LOG_LEVEL).ok())
    }

    fn level_from_env(value: Option<String>) -> Result<LevelFilter, ConfigError> {
        match value {
            Some(level) => LevelFilter::from_str(&level).map_err(|_| {
                ConfigError::Other(format!(
                    "Unrecognized value '{}' for log level in env var {}",
                    level, KASP_HSM_ENV_LOG_LEVEL
                ))
            }),
            None => Ok(LevelFilter::Info),
        }
    }
    fn log_type() -> LogType {
        LogType::Stderr
    }
    fn log_file() -> PathBuf {
        PathBuf::from("./kasp-hsm.log")
    }
    fn syslog_facility() -> String {
        "daemon".to_string()
    }
}


//------------ Config --------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default, deserialize_with = "de_level_filter")]
    log_level: Option<LevelFilter>,

    #[serde(default = "ConfigDefaults::log_type")]
    log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    log_file: PathBuf,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    syslog_facility: String,

    #[serde(default, rename = "repository")]
    pub repositories: Vec<RepositoryConfig>,

    #[serde(default, rename = "builtin_token")]
    pub builtin_tokens: Vec<BuiltinTokenConfig>,
}

impl Config {
    /// Returns the name of the config file to use.
    ///
    /// An explicitly given file wins over the environment, which wins over
    /// the default location.
    pub fn get_config_filename(explicit: Option<&Path>) -> PathBuf {
        match explicit {
            Some(path) => path.to_path_buf(),
            None => env::var_os(KASP_HSM_ENV_CONFIG)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(KASP_HSM_DEFAULT_CONFIG_FILE)),
        }
    }

    /// Reads and verifies the config file and sets up logging.
    pub fn create(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config = Self::load(explicit)?;
        config.init_logging()?;
        info!(
            "{} uses configuration file: {}",
            HSMUTIL_APP,
            Self::get_config_filename(explicit).display()
        );
        Ok(config)
    }

    /// Reads and verifies the config file without touching logging.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config_file = Self::get_config_filename(explicit);

        let mut config = match Self::read_config(&config_file) {
            Err(e) => {
                if config_file == Path::new(KASP_HSM_DEFAULT_CONFIG_FILE) {
                    Err(ConfigError::other(
                        "Cannot find config file. Please use --config to specify its location.",
                    ))
                } else {
                    Err(ConfigError::Other(format!(
                        "Error parsing config file: {}, error: {}",
                        config_file.display(),
                        e
                    )))
                }
            }
            Ok(config) => Ok(config),
        }?;
        config.verify().map_err(|e| {
            ConfigError::Other(format!(
                "Error parsing config file: {}, error: {}",
                config_file.display(),
                e
            ))
        })?;
        if config.log_level.is_none() {
            config.log_level = Some(ConfigDefaults::log_level()?);
        }
        Ok(config)
    }

    pub fn read_config(file: &Path) -> Result<Self, ConfigError> {
        let mut v = String::new();
        let mut f = File::open(file)?;
        f.read_to_string(&mut v)?;

        let c: Config = toml::from_str(&v)?;
        Ok(c)
    }

    /// A configuration without any repositories, logging to stderr.
    pub fn empty() -> Self {
        Config {
            log_level: None,
            log_type: ConfigDefaults::log_type(),
            log_file: ConfigDefaults::log_file(),
            syslog_facility: ConfigDefaults::syslog_facility(),
            repositories: Vec::new(),
            builtin_tokens: Vec::new(),
        }
    }

    pub fn with_repository(mut self, repository: RepositoryConfig) -> Self {
        self.repositories.push(repository);
        self
    }

    pub fn with_builtin_token(mut self, label: &str, pin: &str) -> Self {
        self.builtin_tokens.push(BuiltinTokenConfig {
            label: label.to_string(),
            pin: SecretString::new(pin.to_string()),
        });
        self
    }

    pub fn set_log_level(&mut self, level: LevelFilter) {
        self.log_level = Some(level);
    }

    pub fn log_level(&self) -> LevelFilter {
        self.log_level.unwrap_or(LevelFilter::Info)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.repositories.len() > HSM_MAX_SESSIONS {
            return Err(ConfigError::Other(format!(
                "At most {} repositories can be configured",
                HSM_MAX_SESSIONS
            )));
        }

        let mut names = HashSet::new();
        for repository in &self.repositories {
            repository.verify()?;
            if !names.insert(repository.name.as_str()) {
                return Err(ConfigError::Other(format!(
                    "Duplicate repository name '{}'",
                    repository.name
                )));
            }
        }

        for token in &self.builtin_tokens {
            verify_label(&token.label)?;
            verify_pin(&token.label, &token.pin)?;
        }

        Ok(())
    }

    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
            #[cfg(unix)]
            LogType::Syslog => {
                let facility = Facility::from_str(&self.syslog_facility)
                    .map_err(|_| ConfigError::other("Invalid syslog_facility"))?;
                self.syslog_logger(facility)
            }
            #[cfg(not(unix))]
            LogType::Syslog => Err(ConfigError::other("Syslog is only supported on unix systems")),
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init stderr logging: {}", e)))
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!("Failed to open log file '{}': {}", path.display(), err);
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        self.fern_logger()
            .chain(file)
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init file logging: {}", e)))
    }

    /// Creates a syslog logger and configures correctly.
    #[cfg(unix)]
    fn syslog_logger(&self, facility: Facility) -> Result<(), ConfigError> {
        let process = env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_name()
                    .and_then(std::ffi::OsStr::to_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| String::from("hsmutil"));
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process,
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::tcp(formatter.clone(), ("127.0.0.1", 601)))
            .or_else(|_| syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514)));
        match logger {
            Ok(logger) => self
                .fern_logger()
                .chain(logger)
                .apply()
                .map_err(|e| ConfigError::Other(format!("Failed to init syslog: {}", e))),
            Err(err) => {
                let msg = format!("Cannot connect to syslog: {}", err);
                Err(ConfigError::Other(msg))
            }
        }
    }

    /// Creates and returns a fern logger.
    fn fern_logger(&self) -> fern::Dispatch {
        let show_target = self.log_level() == LevelFilter::Trace || self.log_level() == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level())
    }
}


//------------ RepositoryConfig ----------------------------------------------

/// A token to attach as a named repository.
#[derive(Deserialize)]
pub struct RepositoryConfig {
    pub name: String,

    /// The PKCS#11 library. The built-in provider is used if missing.
    #[serde(default)]
    pub module: Option<PathBuf>,

    pub token_label: String,

    #[serde(default)]
    pub pin: Option<SecretString>,

    /// Destroy the public key object after key generation.
    #[serde(default)]
    pub skip_public_key: bool,

    /// Mark generated private keys as extractable.
    #[serde(default)]
    pub allow_extraction: bool,
}

impl RepositoryConfig {
    /// A repository on the built-in provider.
    pub fn builtin(name: &str, token_label: &str) -> Self {
        RepositoryConfig {
            name: name.to_string(),
            module: None,
            token_label: token_label.to_string(),
            pin: None,
            skip_public_key: false,
            allow_extraction: false,
        }
    }

    /// A repository on a PKCS#11 library.
    pub fn pkcs11(name: &str, module: impl Into<PathBuf>, token_label: &str) -> Self {
        RepositoryConfig {
            module: Some(module.into()),
            ..Self::builtin(name, token_label)
        }
    }

    pub fn with_pin(mut self, pin: &str) -> Self {
        self.pin = Some(SecretString::new(pin.to_string()));
        self
    }

    pub fn with_skip_public_key(mut self, skip: bool) -> Self {
        self.skip_public_key = skip;
        self
    }

    pub fn with_allow_extraction(mut self, allow: bool) -> Self {
        self.allow_extraction = allow;
        self
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::other("Repository names must not be empty"));
        }
        verify_label(&self.token_label)?;
        if let Some(pin) = &self.pin {
            verify_pin(&self.name, pin)?;
        }
        Ok(())
    }
}

impl Clone for RepositoryConfig {
    fn clone(&self) -> Self {
        RepositoryConfig {
            name: self.name.clone(),
            module: self.module.clone(),
            token_label: self.token_label.clone(),
            pin: self.pin.as_ref().map(|pin| SecretString::new(pin.expose_secret().clone())),
            skip_public_key: self.skip_public_key,
            allow_extraction: self.allow_extraction,
        }
    }
}

impl fmt::Debug for RepositoryConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RepositoryConfig")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("token_label", &self.token_label)
            .field("pin", &self.pin.as_ref().map(|_| "<redacted>"))
            .field("skip_public_key", &self.skip_public_key)
            .field("allow_extraction", &self.allow_extraction)
            .finish()
    }
}


//------------ BuiltinTokenConfig --------------------------------------------

/// A token offered by the built-in provider.
#[derive(Debug, Deserialize)]
pub struct BuiltinTokenConfig {
    pub label: String,
    pub pin: SecretString,
}

fn verify_label(label: &str) -> Result<(), ConfigError> {
    if label.is_empty() {
        return Err(ConfigError::other("Token labels must not be empty"));
    }
    if label.len() > TOKEN_LABEL_LENGTH {
        return Err(ConfigError::Other(format!(
            "Token label '{}' is longer than {} bytes",
            label, TOKEN_LABEL_LENGTH
        )));
    }
    Ok(())
}

fn verify_pin(owner: &str, pin: &SecretString) -> Result<(), ConfigError> {
    if pin.expose_secret().len() > HSM_MAX_PIN_LENGTH {
        return Err(ConfigError::Other(format!(
            "PIN for '{}' is longer than {} bytes",
            owner, HSM_MAX_PIN_LENGTH
        )));
    }
    Ok(())
}


//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}


//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        match string.as_str() {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(de::Error::custom(format!(
                "expected \"stderr\", \"file\" or \"syslog\", found : \"{}\"",
                string
            ))),
        }
    }
}

fn de_level_filter<'de, D>(d: D) -> Result<Option<LevelFilter>, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map(Some).map_err(de::Error::custom)
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const EXAMPLE: &str = r#"
        log_level = "debug"
        log_type = "file"
        log_file = "/tmp/kasp-hsm.log"

        [[repository]]
        name = "SoftHSM"
        module = "/usr/lib/softhsm/libsofthsm2.so"
        token_label = "OpenDNSSEC"
        pin = "1234"
        skip_public_key = true

        [[repository]]
        name = "Builtin"
        token_label = "builtin"

        [[builtin_token]]
        label = "builtin"
        pin = "0000"
    "#;

    #[test]
    fn should_parse_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(EXAMPLE.as_bytes()).unwrap();

        let c = Config::read_config(file.path()).unwrap();
        c.verify().unwrap();
        assert_eq!(c.log_level(), LevelFilter::Debug);
        assert_eq!(c.log_type, LogType::File);
        assert_eq!(c.repositories.len(), 2);

        let softhsm = &c.repositories[0];
        assert_eq!(softhsm.name, "SoftHSM");
        assert_eq!(softhsm.module, Some(PathBuf::from("/usr/lib/softhsm/libsofthsm2.so")));
        assert_eq!(softhsm.pin.as_ref().map(|p| p.expose_secret().as_str()), Some("1234"));
        assert!(softhsm.skip_public_key);
        assert!(!softhsm.allow_extraction);

        let builtin = &c.repositories[1];
        assert!(builtin.module.is_none());
        assert!(builtin.pin.is_none());

        assert_eq!(c.builtin_tokens[0].label, "builtin");
    }

    #[test]
    fn should_use_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.log_type, LogType::Stderr);
        assert_eq!(c.syslog_facility, "daemon");
        assert!(c.repositories.is_empty());
    }

    #[test]
    fn should_reject_unknown_log_type() {
        assert!(toml::from_str::<Config>(r#"log_type = "journal""#).is_err());
        assert!(toml::from_str::<Config>(r#"log_level = "loud""#).is_err());
    }

    #[test]
    fn should_report_bad_log_level_in_environment() {
        assert_eq!(ConfigDefaults::level_from_env(None).unwrap(), LevelFilter::Info);
        assert_eq!(
            ConfigDefaults::level_from_env(Some("trace".into())).unwrap(),
            LevelFilter::Trace
        );
        let err = ConfigDefaults::level_from_env(Some("loud".into())).unwrap_err();
        assert!(err.to_string().contains(KASP_HSM_ENV_LOG_LEVEL));
    }

    #[test]
    fn should_reject_duplicate_names() {
        let c = Config::empty()
            .with_repository(RepositoryConfig::builtin("a", "one"))
            .with_repository(RepositoryConfig::builtin("a", "two"));
        assert!(c.verify().is_err());
    }

    #[test]
    fn should_reject_bad_labels_and_pins() {
        let long_label = "x".repeat(TOKEN_LABEL_LENGTH + 1);
        assert!(RepositoryConfig::builtin("a", &long_label).verify().is_err());
        assert!(RepositoryConfig::builtin("a", "").verify().is_err());
        assert!(RepositoryConfig::builtin("", "label").verify().is_err());

        let long_pin = "1".repeat(HSM_MAX_PIN_LENGTH + 1);
        assert!(
            RepositoryConfig::builtin("a", "label")
                .with_pin(&long_pin)
                .verify()
                .is_err()
        );
        assert!(Config::empty().with_builtin_token("label", &long_pin).verify().is_err());
    }

    #[test]
    fn should_not_show_pin_in_debug_output() {
        let repository = RepositoryConfig::builtin("a", "label").with_pin("secret-pin");
        let debug = format!("{:?}", repository.clone());
        assert!(!debug.contains("secret-pin"));
    }

    #[test]
    fn should_prefer_explicit_config_file() {
        let explicit = Path::new("/tmp/explicit.conf");
        assert_eq!(Config::get_config_filename(Some(explicit)), explicit);
    }

    #[test]
    fn should_set_correct_log_levels() {
        fn void_logger(config: &str) -> Box<dyn log::Log> {
            let c: Config = toml::from_str(config).unwrap();
            let void_output = fern::Output::writer(Box::new(io::sink()), "");
            let (_, void_logger) = c.fern_logger().chain(void_output).into_log();
            void_logger
        }

        fn metadata(target: &str, level: log::Level) -> log::Metadata<'_> {
            log::Metadata::builder().target(target).level(level).build()
        }

        let debug = void_logger(r#"log_level = "debug""#);
        assert!(debug.enabled(&metadata("kasp_hsm::hsm::session", log::Level::Debug)));
        assert!(debug.enabled(&metadata("kasp_hsm::hsm::provider::pkcs11", log::Level::Debug)));
        assert!(!debug.enabled(&metadata("kasp_hsm::hsm::provider::pkcs11", log::Level::Trace)));

        let trace = void_logger(r#"log_level = "trace""#);
        assert!(trace.enabled(&metadata("kasp_hsm::hsm::provider::pkcs11", log::Level::Trace)));

        let warn = void_logger(r#"log_level = "warn""#);
        assert!(!warn.enabled(&metadata("kasp_hsm::hsm::provider::pkcs11", log::Level::Info)));
    }
}
