//! The process wide registry of loaded providers.
//!
//! Repositories naming the same library share one loaded module. The
//! registry only holds weak references: a module is finalized when the last
//! session using it is gone, and only if it was initialized by us.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use lazy_static::lazy_static;
use log::{debug, info, warn};

use crate::error::{HsmError, Rv};

#[cfg(feature = "hsm")]
use super::provider::Pkcs11Provider;
use super::provider::{BuiltinProvider, Provider};

lazy_static! {
    static ref REGISTRY: Mutex<HashMap<ModuleKey, Weak<Module>>> = Mutex::new(HashMap::new());
}


//------------ ModuleKey -----------------------------------------------------

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum ModuleKey {
    /// A PKCS#11 library, by file name.
    Library(String),

    /// A built-in provider, by its process unique id.
    Builtin(u64),
}


//------------ Module --------------------------------------------------------

/// A loaded and initialized provider.
#[derive(Debug)]
pub struct Module {
    key: ModuleKey,
    provider: Provider,

    /// Whether our `C_Initialize` call succeeded.
    ///
    /// If somebody else initialized the provider, it is theirs to finalize.
    initialized_here: bool,
}

impl Module {
    /// Returns the module for a library path or the built-in provider.
    ///
    /// Loads and initializes the provider if it is not in use yet.
    pub fn acquire(path: Option<&Path>, builtin: &Arc<BuiltinProvider>) -> Result<Arc<Module>, HsmError> {
        let key = match path {
            Some(path) => ModuleKey::Library(library_name(path)),
            None => ModuleKey::Builtin(builtin.id()),
        };

        let mut registry = loop {
            let registry = REGISTRY.lock().unwrap();
            match registry.get(&key) {
                Some(weak) => {
                    if let Some(module) = weak.upgrade() {
                        debug!("Reusing provider {}", module.name());
                        return Ok(module);
                    }
                    // The last user is dropping it right now. Wait for the
                    // finalization to complete.
                    drop(registry);
                    std::thread::yield_now();
                }
                None => break registry,
            }
        };

        let provider = match path {
            #[cfg(feature = "hsm")]
            Some(path) => Provider::Pkcs11(Arc::new(Pkcs11Provider::load(path)?)),
            #[cfg(not(feature = "hsm"))]
            Some(path) => {
                return Err(HsmError::ModuleNotFound {
                    path: path.to_path_buf(),
                    reason: "PKCS#11 support is not compiled in".to_string(),
                });
            }
            None => Provider::Builtin(builtin.clone()),
        };

        let initialized_here = match provider.initialize() {
            Ok(()) => true,
            Err(err) if err.is(Rv::CRYPTOKI_ALREADY_INITIALIZED) => {
                debug!("Provider {} was already initialized", provider.name());
                false
            }
            Err(err) => return Err(err.into()),
        };
        info!("Loaded provider {}", provider.name());

        let module = Arc::new(Module {
            key: key.clone(),
            provider,
            initialized_here,
        });
        registry.insert(key, Arc::downgrade(&module));
        Ok(module)
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    pub fn name(&self) -> String {
        self.provider.name()
    }

    pub fn initialized_here(&self) -> bool {
        self.initialized_here
    }

    /// Returns whether the two modules are the same loaded provider.
    pub fn same(left: &Arc<Module>, right: &Arc<Module>) -> bool {
        Arc::ptr_eq(left, right)
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        // The entry stays in the registry until finalization is done so that
        // nobody initializes the provider again in between.
        let mut registry = REGISTRY.lock().unwrap();
        if self.initialized_here {
            match self.provider.finalize() {
                Ok(()) => info!("Finalized provider {}", self.provider.name()),
                Err(err) => warn!("Could not finalize provider {}: {}", self.provider.name(), err),
            }
        }
        if registry.get(&self.key).is_some_and(|weak| weak.strong_count() == 0) {
            registry.remove(&self.key);
        }
    }
}

fn library_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}


//------------ Tests ---------------------------------------------------------
