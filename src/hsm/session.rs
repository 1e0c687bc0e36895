//! Sessions with a token, one per attached repository.

use std::sync::Arc;

use log::{debug, error, info, trace, warn};

use crate::config::RepositoryConfig;
use crate::error::{HsmError, Rv};

use super::module::Module;
use super::provider::{
    Attribute, AttributeType, BuiltinProvider, Mechanism, ObjectHandle, Provider, SessionHandle, SessionInfo, SlotId,
};
use super::slot::find_slot;


//------------ KeyPolicy -----------------------------------------------------

/// How keys are generated in a repository.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct KeyPolicy {
    /// Destroy public key objects right after generating a key pair.
    pub skip_public_key: bool,

    /// Allow private keys to leave the token.
    pub allow_extraction: bool,
}


//------------ Session -------------------------------------------------------

/// An open session with the token of a repository.
///
/// The session keeps the provider loaded. It is closed when dropped, but
/// only [`Session::close`] logs out.
#[derive(Debug)]
pub struct Session {
    repository: String,
    token_label: String,
    policy: KeyPolicy,
    module: Arc<Module>,
    slot: SlotId,
    handle: SessionHandle,
    closed: bool,
}

impl Session {
    /// Opens a session and logs in.
    ///
    /// Fails with [`HsmError::PinIncorrect`] if the token rejects the PIN.
    /// Nothing is left open when this fails.
    pub fn open(repository: &RepositoryConfig, pin: &str, builtin: &Arc<BuiltinProvider>) -> Result<Self, HsmError> {
        let module = Module::acquire(repository.module.as_deref(), builtin)?;
        let slot = find_slot(module.provider(), &repository.token_label)?;
        let handle = module.provider().open_session(slot).map_err(|err| {
            error!("Could not open session for repository '{}': {}", repository.name, err);
            HsmError::Device(err)
        })?;

        let session = Session {
            repository: repository.name.clone(),
            token_label: repository.token_label.clone(),
            policy: KeyPolicy {
                skip_public_key: repository.skip_public_key,
                allow_extraction: repository.allow_extraction,
            },
            module,
            slot,
            handle,
            closed: false,
        };

        // Dropping the session on failure closes it again.
        match session.provider().login(handle, pin) {
            Ok(()) => {}
            Err(err) if err.is(Rv::USER_ALREADY_LOGGED_IN) => {
                debug!("Token '{}' is already logged in", session.token_label);
            }
            Err(err) if err.is(Rv::PIN_INCORRECT) => {
                warn!("Incorrect PIN for repository '{}'", session.repository);
                return Err(HsmError::PinIncorrect(session.repository.clone()));
            }
            Err(err) => {
                error!("Could not log in to repository '{}': {}", session.repository, err);
                return Err(HsmError::Device(err));
            }
        }

        info!(
            "Attached repository '{}' (token '{}' on {})",
            session.repository,
            session.token_label,
            session.module.name()
        );
        Ok(session)
    }

    /// Opens another session on the same token.
    ///
    /// The token is already logged in, so no PIN is needed.
    pub fn duplicate(&self) -> Result<Self, HsmError> {
        let handle = self.provider().open_session(self.slot)?;
        debug!(
            "Opened session {} for repository '{}'",
            handle.value(),
            self.repository
        );
        Ok(Session {
            repository: self.repository.clone(),
            token_label: self.token_label.clone(),
            policy: self.policy,
            module: self.module.clone(),
            slot: self.slot,
            handle,
            closed: false,
        })
    }

    /// Closes the session.
    ///
    /// If `unload` is set, logs out first. The provider is finalized once no
    /// session uses it anymore.
    pub fn close(mut self, unload: bool) -> Result<(), HsmError> {
        let res = if unload {
            match self.provider().logout(self.handle) {
                Ok(()) => Ok(()),
                Err(err) if err.is(Rv::USER_NOT_LOGGED_IN) => Ok(()),
                Err(err) => Err(err),
            }
        } else {
            Ok(())
        };
        let closed = self.provider().close_session(self.handle);
        self.closed = true;
        debug!("Closed session for repository '{}'", self.repository);
        res?;
        closed?;
        Ok(())
    }

    /// Checks that the session and its token are still usable.
    ///
    /// Queries the session and opens and closes a fresh one on the slot.
    pub fn probe(&self) -> Result<(), HsmError> {
        let info = self.info()?;
        if info.slot != self.slot {
            return Err(HsmError::ContextError(format!(
                "session of repository '{}' moved from slot {} to {}",
                self.repository, self.slot, info.slot
            )));
        }
        let fresh = self.provider().open_session(self.slot)?;
        self.provider().close_session(fresh)?;
        Ok(())
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn token_label(&self) -> &str {
        &self.token_label
    }

    pub fn policy(&self) -> KeyPolicy {
        self.policy
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    fn provider(&self) -> &Provider {
        self.module.provider()
    }
}

/// # Device calls
impl Session {
    pub fn info(&self) -> Result<SessionInfo, HsmError> {
        Ok(self.provider().session_info(self.handle)?)
    }

    pub fn find_objects(&self, template: &[Attribute]) -> Result<Vec<ObjectHandle>, HsmError> {
        Ok(self.provider().find_objects(self.handle, template)?)
    }

    pub fn get_attributes(&self, object: ObjectHandle, types: &[AttributeType]) -> Result<Vec<Attribute>, HsmError> {
        Ok(self.provider().get_attributes(self.handle, object, types)?)
    }

    pub fn generate_key_pair(
        &self,
        mechanism: Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(ObjectHandle, ObjectHandle), HsmError> {
        trace!("[{}] generating key pair with {:?}", self.repository, mechanism);
        Ok(self
            .provider()
            .generate_key_pair(self.handle, mechanism, public_template, private_template)?)
    }

    pub fn generate_key(&self, mechanism: Mechanism, template: &[Attribute]) -> Result<ObjectHandle, HsmError> {
        trace!("[{}] generating key with {:?}", self.repository, mechanism);
        Ok(self.provider().generate_key(self.handle, mechanism, template)?)
    }

    pub fn destroy_object(&self, object: ObjectHandle) -> Result<(), HsmError> {
        Ok(self.provider().destroy_object(self.handle, object)?)
    }

    pub fn sign(&self, mechanism: Mechanism, key: ObjectHandle, data: &[u8]) -> Result<Vec<u8>, HsmError> {
        Ok(self.provider().sign(self.handle, mechanism, key, data)?)
    }

    pub fn digest(&self, mechanism: Mechanism, data: &[u8]) -> Result<Vec<u8>, HsmError> {
        Ok(self.provider().digest(self.handle, mechanism, data)?)
    }

    pub fn generate_random(&self, len: usize) -> Result<Vec<u8>, HsmError> {
        Ok(self.provider().generate_random(self.handle, len)?)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.provider().close_session(self.handle) {
                // The token may be gone already.
                debug!("Could not close session for repository '{}': {}", self.repository, err);
            }
        }
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn builtin() -> Arc<BuiltinProvider> {
        Arc::new(BuiltinProvider::new().with_token("zone", "1234"))
    }

    #[test]
    fn should_open_and_close() {
        let builtin = builtin();
        let session = Session::open(&RepositoryConfig::builtin("repo", "zone"), "1234", &builtin).unwrap();
        assert_eq!(session.repository(), "repo");
        assert!(session.probe().is_ok());
        session.close(true).unwrap();

        // The provider was finalized with the last session.
        assert!(builtin.slots_with_token().is_err());
    }

    #[test]
    fn should_report_incorrect_pin() {
        let builtin = builtin();
        let err = Session::open(&RepositoryConfig::builtin("repo", "zone"), "0000", &builtin).unwrap_err();
        assert!(matches!(err, HsmError::PinIncorrect(name) if name == "repo"));
        assert!(builtin.slots_with_token().is_err());
    }

    #[test]
    fn should_report_missing_token() {
        let builtin = builtin();
        let err = Session::open(&RepositoryConfig::builtin("repo", "other"), "1234", &builtin).unwrap_err();
        assert!(matches!(err, HsmError::RepositoryNotFound(_)));
    }

    #[test]
    fn should_share_login_with_second_repository() {
        let builtin = builtin();
        let first = Session::open(&RepositoryConfig::builtin("one", "zone"), "1234", &builtin).unwrap();
        let second = Session::open(&RepositoryConfig::builtin("two", "zone"), "1234", &builtin).unwrap();
        assert!(Module::same(first.module(), second.module()));
        drop(first);
        assert!(second.probe().is_ok());
    }

    #[test]
    fn should_duplicate_without_login() {
        let builtin = builtin();
        let session = Session::open(&RepositoryConfig::builtin("repo", "zone"), "1234", &builtin).unwrap();
        let copy = session.duplicate().unwrap();
        assert_eq!(copy.slot(), session.slot());
        assert_eq!(copy.generate_random(8).unwrap().len(), 8);
        copy.close(false).unwrap();
        assert!(session.probe().is_ok());
    }

    #[test]
    fn should_fail_probe_on_removed_token() {
        let builtin = builtin();
        let session = Session::open(&RepositoryConfig::builtin("repo", "zone"), "1234", &builtin).unwrap();
        builtin.set_token_present("zone", false);
        assert!(session.probe().is_err());
    }
}
