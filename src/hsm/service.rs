//! The HSM service: attached repositories and the contexts derived from them.

use std::collections::HashSet;
use std::mem;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use secrecy::ExposeSecret;

use crate::config::{Config, RepositoryConfig};
use crate::constants::HSM_MAX_SESSIONS;
use crate::error::HsmError;

use super::cache::KeyCache;
use super::context::Context;
use super::pin::CredentialStore;
use super::provider::BuiltinProvider;
use super::session::Session;


//------------ HsmService ----------------------------------------------------

/// Owns the sessions of all attached repositories.
///
/// Workers do not use these sessions directly. They get their own context
/// through [`HsmService::create_context`] and hand it back through
/// [`HsmService::destroy_context`]. All contexts share one key cache.
pub struct HsmService {
    builtin: Arc<BuiltinProvider>,
    credentials: Arc<dyn CredentialStore>,
    global: Mutex<Context>,
    cache: Arc<KeyCache>,
}

impl HsmService {
    pub fn new(builtin: Arc<BuiltinProvider>, credentials: Arc<dyn CredentialStore>) -> Self {
        let cache = Arc::new(KeyCache::new());
        HsmService {
            builtin,
            credentials,
            global: Mutex::new(Context::new(cache.clone())),
            cache,
        }
    }

    /// Creates a service and attaches every repository of the config.
    ///
    /// The built-in provider gets the tokens listed in the config.
    pub fn from_config(config: &Config, credentials: Arc<dyn CredentialStore>) -> Result<Self, HsmError> {
        let builtin = BuiltinProvider::new();
        for token in &config.builtin_tokens {
            builtin.add_token(&token.label, token.pin.expose_secret());
        }
        let service = HsmService::new(Arc::new(builtin), credentials);
        service.attach(&config.repositories)?;
        Ok(service)
    }

    /// Attaches repositories and returns how many are attached now.
    ///
    /// Either all repositories are attached or none. Sessions opened before
    /// a failure are closed again.
    pub fn attach(&self, repositories: &[RepositoryConfig]) -> Result<usize, HsmError> {
        if repositories.is_empty() {
            return Err(HsmError::NoRepositories);
        }

        let mut global = self.global.lock().unwrap();
        if global.sessions().len() + repositories.len() > HSM_MAX_SESSIONS {
            return Err(HsmError::ContextError(format!(
                "cannot attach more than {} repositories",
                HSM_MAX_SESSIONS
            )));
        }
        let mut names: HashSet<String> = global.repositories().into_iter().collect();
        for repository in repositories {
            if !names.insert(repository.name.clone()) {
                return Err(HsmError::ContextError(format!(
                    "repository '{}' is already attached",
                    repository.name
                )));
            }
        }

        let first_index = global.sessions().len();
        let mut opened = Vec::with_capacity(repositories.len());
        for (offset, repository) in repositories.iter().enumerate() {
            match self.open_session(first_index + offset, repository) {
                Ok(session) => opened.push(session),
                Err(err) => {
                    warn!("Could not attach repository '{}': {}", repository.name, err);
                    for session in opened {
                        if let Err(err) = session.close(false) {
                            debug!("Error closing session after failed attach: {}", err);
                        }
                    }
                    return Err(err);
                }
            }
        }

        for session in opened {
            global.attach_session(session)?;
        }
        info!("{} repositories attached", global.sessions().len());
        Ok(global.sessions().len())
    }

    /// Opens a session, finding a PIN if the repository has none configured.
    fn open_session(&self, index: usize, repository: &RepositoryConfig) -> Result<Session, HsmError> {
        if let Some(pin) = &repository.pin {
            return Session::open(repository, pin.expose_secret(), &self.builtin);
        }

        let mut rejected = false;
        loop {
            let pin = match self.credentials.fetch(index, &repository.name)? {
                Some(pin) => pin,
                None if rejected => return Err(HsmError::PinIncorrect(repository.name.clone())),
                None => return Err(HsmError::PinUnavailable(repository.name.clone())),
            };
            match Session::open(repository, pin.expose_secret(), &self.builtin) {
                Ok(session) => {
                    self.credentials.save(index, &repository.name, &pin);
                    return Ok(session);
                }
                Err(HsmError::PinIncorrect(_)) => {
                    self.credentials.clear(index, &repository.name);
                    rejected = true;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Returns a new context with its own sessions to all repositories.
    pub fn create_context(&self) -> Result<Context, HsmError> {
        let global = self.global.lock().unwrap();
        if global.is_empty() {
            return Err(HsmError::NoRepositories);
        }
        global.duplicate()
    }

    /// Closes the sessions of a context without logging out.
    pub fn destroy_context(&self, context: Context) {
        if let Err(err) = context.close(false) {
            warn!("Error while destroying context: {}", err);
        }
    }

    /// Logs out of and closes all repositories.
    ///
    /// Contexts created earlier keep their sessions, but the tokens are
    /// logged out.
    pub fn close(&self) -> Result<(), HsmError> {
        let context = {
            let mut global = self.global.lock().unwrap();
            mem::replace(&mut *global, Context::new(self.cache.clone()))
        };
        let res = context.close(true);
        self.cache.clear();
        info!("Closed all repositories");
        res
    }

    /// Checks the sessions of all attached repositories.
    pub fn check(&self) -> Result<(), HsmError> {
        self.global.lock().unwrap().check()
    }

    pub fn repositories(&self) -> Vec<String> {
        self.global.lock().unwrap().repositories()
    }

    pub fn cache(&self) -> &Arc<KeyCache> {
        &self.cache
    }

    pub fn builtin(&self) -> &Arc<BuiltinProvider> {
        &self.builtin
    }
}


//------------ Tests ---------------------------------------------------------
