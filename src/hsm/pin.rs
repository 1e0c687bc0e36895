//! Where PINs come from when the configuration has none.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use log::{debug, warn};
use secrecy::{ExposeSecret, SecretString};

use crate::constants::{HSM_MAX_PIN_LENGTH, HSM_MAX_SESSIONS};
use crate::error::HsmError;


//------------ CredentialStore -----------------------------------------------

/// A source of PINs for repositories.
///
/// The `index` is the position of the repository in the list being
/// attached. A store decides by itself whether another attempt is worth
/// making: after [`clear`](CredentialStore::clear), returning `None` from
/// [`fetch`](CredentialStore::fetch) gives up on the repository.
pub trait CredentialStore: Send + Sync {
    /// Returns the PIN to try next, if any.
    fn fetch(&self, index: usize, repository: &str) -> Result<Option<SecretString>, HsmError>;

    /// Forgets a PIN that the token rejected.
    fn clear(&self, index: usize, repository: &str);

    /// Remembers a PIN that the token accepted.
    fn save(&self, index: usize, repository: &str, pin: &SecretString);
}

fn clone_pin(pin: &SecretString) -> SecretString {
    SecretString::new(pin.expose_secret().clone())
}


//------------ ConfiguredPins ------------------------------------------------

/// PINs known up front.
///
/// A rejected PIN is dropped, so each one is tried only once.
#[derive(Default)]
pub struct ConfiguredPins {
    pins: Mutex<HashMap<String, SecretString>>,
}

impl ConfiguredPins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pin(self, repository: &str, pin: &str) -> Self {
        self.pins
            .lock()
            .unwrap()
            .insert(repository.to_string(), SecretString::new(pin.to_string()));
        self
    }
}

impl fmt::Debug for ConfiguredPins {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut names: Vec<String> = self.pins.lock().unwrap().keys().cloned().collect();
        names.sort();
        f.debug_struct("ConfiguredPins").field("repositories", &names).finish()
    }
}

impl CredentialStore for ConfiguredPins {
    fn fetch(&self, _index: usize, repository: &str) -> Result<Option<SecretString>, HsmError> {
        Ok(self.pins.lock().unwrap().get(repository).map(clone_pin))
    }

    fn clear(&self, _index: usize, repository: &str) {
        self.pins.lock().unwrap().remove(repository);
    }

    fn save(&self, _index: usize, _repository: &str, _pin: &SecretString) {}
}


//------------ PinCache ------------------------------------------------------

/// Remembers accepted PINs in front of another store.
///
/// There is one slot per repository index. A slot only answers for the
/// repository it was saved for.
pub struct PinCache<S> {
    slots: Mutex<Vec<Option<(String, SecretString)>>>,
    inner: S,
}

impl<S: CredentialStore> PinCache<S> {
    pub fn new(inner: S) -> Self {
        PinCache {
            slots: Mutex::new((0..HSM_MAX_SESSIONS).map(|_| None).collect()),
            inner,
        }
    }

    fn check_index(index: usize) -> Result<(), HsmError> {
        if index >= HSM_MAX_SESSIONS {
            Err(HsmError::invalid_argument(format!(
                "PIN slot {} out of range, the maximum is {}",
                index,
                HSM_MAX_SESSIONS - 1
            )))
        } else {
            Ok(())
        }
    }
}

impl<S: fmt::Debug> fmt::Debug for PinCache<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let cached = self.slots.lock().unwrap().iter().filter(|slot| slot.is_some()).count();
        f.debug_struct("PinCache")
            .field("cached", &cached)
            .field("inner", &self.inner)
            .finish()
    }
}

impl<S: CredentialStore> CredentialStore for PinCache<S> {
    fn fetch(&self, index: usize, repository: &str) -> Result<Option<SecretString>, HsmError> {
        Self::check_index(index)?;
        let cached = match &self.slots.lock().unwrap()[index] {
            Some((name, pin)) if name == repository => Some(clone_pin(pin)),
            _ => None,
        };
        match cached {
            Some(pin) => {
                debug!("Using cached PIN for repository '{}'", repository);
                Ok(Some(pin))
            }
            None => self.inner.fetch(index, repository),
        }
    }

    fn clear(&self, index: usize, repository: &str) {
        if index < HSM_MAX_SESSIONS {
            self.slots.lock().unwrap()[index] = None;
        }
        self.inner.clear(index, repository);
    }

    fn save(&self, index: usize, repository: &str, pin: &SecretString) {
        if index < HSM_MAX_SESSIONS {
            self.slots.lock().unwrap()[index] = Some((repository.to_string(), clone_pin(pin)));
        }
        self.inner.save(index, repository, pin);
    }
}


//------------ PromptPins ----------------------------------------------------

/// Asks for PINs on the terminal.
#[derive(Debug)]
pub struct PromptPins {
    attempts: Mutex<HashMap<String, usize>>,
    max_attempts: usize,
}

impl PromptPins {
    pub fn new(max_attempts: usize) -> Self {
        PromptPins {
            attempts: Mutex::new(HashMap::new()),
            max_attempts,
        }
    }
}

impl Default for PromptPins {
    fn default() -> Self {
        Self::new(3)
    }
}

impl CredentialStore for PromptPins {
    fn fetch(&self, _index: usize, repository: &str) -> Result<Option<SecretString>, HsmError> {
        let failed = self.attempts.lock().unwrap().get(repository).copied().unwrap_or(0);
        if failed >= self.max_attempts {
            warn!("Giving up on repository '{}' after {} attempts", repository, failed);
            return Ok(None);
        }
        let pin = rpassword::prompt_password(format!("Enter PIN for repository {}: ", repository))
            .map_err(|_| HsmError::PinUnavailable(repository.to_string()))?;
        if pin.is_empty() || pin.len() > HSM_MAX_PIN_LENGTH {
            return Err(HsmError::invalid_argument(format!(
                "a PIN must have between 1 and {} characters",
                HSM_MAX_PIN_LENGTH
            )));
        }
        Ok(Some(SecretString::new(pin)))
    }

    fn clear(&self, _index: usize, repository: &str) {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(repository.to_string())
            .or_insert(0) += 1;
    }

    fn save(&self, _index: usize, repository: &str, _pin: &SecretString) {
        self.attempts.lock().unwrap().remove(repository);
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch(store: &dyn CredentialStore, index: usize, repository: &str) -> Option<String> {
        store
            .fetch(index, repository)
            .unwrap()
            .map(|pin| pin.expose_secret().clone())
    }

    #[test]
    fn should_try_configured_pin_once() {
        let store = ConfiguredPins::new().with_pin("repo", "1234");
        assert_eq!(fetch(&store, 0, "repo").as_deref(), Some("1234"));
        assert_eq!(fetch(&store, 0, "other"), None);
        store.clear(0, "repo");
        assert_eq!(fetch(&store, 0, "repo"), None);
    }

    #[test]
    fn should_serve_saved_pin_from_cache() {
        let cache = PinCache::new(ConfiguredPins::new());
        assert_eq!(fetch(&cache, 3, "repo"), None);
        cache.save(3, "repo", &SecretString::new("1234".to_string()));
        assert_eq!(fetch(&cache, 3, "repo").as_deref(), Some("1234"));

        // Slots belong to one repository.
        assert_eq!(fetch(&cache, 3, "other"), None);
        assert_eq!(fetch(&cache, 4, "repo"), None);

        cache.clear(3, "repo");
        assert_eq!(fetch(&cache, 3, "repo"), None);
    }

    #[test]
    fn should_fall_back_to_inner_store() {
        let cache = PinCache::new(ConfiguredPins::new().with_pin("repo", "9876"));
        assert_eq!(fetch(&cache, 0, "repo").as_deref(), Some("9876"));
        cache.clear(0, "repo");
        assert_eq!(fetch(&cache, 0, "repo"), None);
    }

    #[test]
    fn should_reject_out_of_range_slot() {
        let cache = PinCache::new(ConfiguredPins::new());
        assert!(matches!(
            cache.fetch(HSM_MAX_SESSIONS, "repo"),
            Err(HsmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn should_stop_prompting_after_max_attempts() {
        let store = PromptPins::new(1);
        store.clear(0, "repo");
        assert!(store.fetch(0, "repo").unwrap().is_none());
    }
}
