//! Contexts: the sessions a worker uses, one per attached repository.

use std::fmt;
use std::sync::{Arc, Mutex};

use log::{debug, error, warn};

use crate::constants::HSM_MAX_SESSIONS;
use crate::error::HsmError;

use super::cache::KeyCache;
use super::session::Session;


//------------ LatchedError --------------------------------------------------

/// The first error that happened in a context.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LatchedError {
    pub action: String,
    pub message: String,
}

impl fmt::Display for LatchedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.action, self.message)
    }
}


//------------ Context -------------------------------------------------------

/// A set of sessions, one per attached repository.
///
/// A context owns its sessions and must only be used by one worker at a
/// time. Use [`Context::duplicate`] to get one for another worker.
///
/// Failing operations keep the first error in a latch until it is taken
/// with [`Context::take_error`].
#[derive(Debug)]
pub struct Context {
    sessions: Vec<Session>,
    error: Mutex<Option<LatchedError>>,
    cache: Arc<KeyCache>,
}

impl Context {
    pub fn new(cache: Arc<KeyCache>) -> Self {
        Context {
            sessions: Vec::new(),
            error: Mutex::new(None),
            cache,
        }
    }

    pub fn attach_session(&mut self, session: Session) -> Result<(), HsmError> {
        if self.sessions.len() >= HSM_MAX_SESSIONS {
            return Err(HsmError::ContextError(format!(
                "cannot attach more than {} repositories",
                HSM_MAX_SESSIONS
            )));
        }
        if self.find_session(session.repository()).is_some() {
            return Err(HsmError::ContextError(format!(
                "repository '{}' is already attached",
                session.repository()
            )));
        }
        self.sessions.push(session);
        Ok(())
    }

    /// Creates a new context with a new session for each of ours.
    ///
    /// The key cache is shared. If any session cannot be duplicated, the
    /// ones already opened are closed again.
    pub fn duplicate(&self) -> Result<Self, HsmError> {
        let mut res = Context::new(self.cache.clone());
        for session in &self.sessions {
            match session.duplicate() {
                Ok(session) => res.sessions.push(session),
                Err(err) => {
                    error!(
                        "Could not duplicate session of repository '{}': {}",
                        session.repository(),
                        err
                    );
                    return Err(err);
                }
            }
        }
        Ok(res)
    }

    /// Checks every session.
    ///
    /// Nothing is repaired, that is up to the caller.
    pub fn check(&self) -> Result<(), HsmError> {
        if self.sessions.is_empty() {
            return self.latch("check", Err(HsmError::NoRepositories));
        }
        for session in &self.sessions {
            if let Err(err) = session.probe() {
                warn!("Repository '{}' failed its check: {}", session.repository(), err);
                return self.latch("check", Err(err));
            }
        }
        Ok(())
    }

    /// Closes all sessions.
    ///
    /// With `unload`, also logs out of every token. All sessions are closed
    /// even if some fail, the first failure is returned.
    pub fn close(self, unload: bool) -> Result<(), HsmError> {
        let mut res = Ok(());
        for session in self.sessions {
            let repository = session.repository().to_string();
            if let Err(err) = session.close(unload) {
                warn!("Could not close session of repository '{}': {}", repository, err);
                if res.is_ok() {
                    res = Err(err);
                }
            }
        }
        debug!("Closed context");
        res
    }

    pub fn session(&self, repository: &str) -> Result<&Session, HsmError> {
        self.find_session(repository)
            .ok_or_else(|| HsmError::RepositoryNotFound(repository.to_string()))
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn cache(&self) -> &Arc<KeyCache> {
        &self.cache
    }

    /// The names of the attached repositories, in attach order.
    pub fn repositories(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.repository().to_string()).collect()
    }

    fn find_session(&self, repository: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.repository() == repository)
    }
}

/// # Error latch
impl Context {
    /// Records an error unless one is recorded already.
    pub fn set_error(&self, action: &str, message: impl fmt::Display) {
        let mut latch = self.error.lock().unwrap();
        if latch.is_none() {
            *latch = Some(LatchedError {
                action: action.to_string(),
                message: message.to_string(),
            });
        }
    }

    /// Returns and clears the recorded error.
    pub fn take_error(&self) -> Option<LatchedError> {
        self.error.lock().unwrap().take()
    }

    pub fn peek_error(&self) -> Option<LatchedError> {
        self.error.lock().unwrap().clone()
    }

    /// Records the error of a result, if any, and passes the result on.
    pub fn latch<T>(&self, action: &str, res: Result<T, HsmError>) -> Result<T, HsmError> {
        if let Err(err) = &res {
            self.set_error(action, err);
        }
        res
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepositoryConfig;
    use crate::hsm::provider::BuiltinProvider;

    fn context(builtin: &Arc<BuiltinProvider>) -> Context {
        let mut ctx = Context::new(Arc::new(KeyCache::new()));
        for (name, label) in [("one", "first"), ("two", "second")] {
            let session = Session::open(&RepositoryConfig::builtin(name, label), "1234", builtin).unwrap();
            ctx.attach_session(session).unwrap();
        }
        ctx
    }

    fn builtin() -> Arc<BuiltinProvider> {
        Arc::new(
            BuiltinProvider::new()
                .with_token("first", "1234")
                .with_token("second", "1234"),
        )
    }

    #[test]
    fn should_keep_first_error_until_taken() {
        let ctx = Context::new(Arc::new(KeyCache::new()));
        assert!(ctx.take_error().is_none());
        ctx.set_error("sign", "first");
        ctx.set_error("sign", "second");
        assert_eq!(ctx.peek_error().unwrap().message, "first");
        assert_eq!(ctx.take_error().unwrap().to_string(), "sign: first");
        assert!(ctx.take_error().is_none());
    }

    #[test]
    fn should_look_up_sessions_by_repository() {
        let builtin = builtin();
        let ctx = context(&builtin);
        assert_eq!(ctx.repositories(), vec!["one", "two"]);
        assert_eq!(ctx.session("two").unwrap().token_label(), "second");
        assert!(matches!(ctx.session("three"), Err(HsmError::RepositoryNotFound(_))));
    }

    #[test]
    fn should_reject_duplicate_repository() {
        let builtin = builtin();
        let mut ctx = context(&builtin);
        let session = Session::open(&RepositoryConfig::builtin("one", "second"), "1234", &builtin).unwrap();
        assert!(ctx.attach_session(session).is_err());
    }

    #[test]
    fn should_duplicate_with_shared_cache() {
        let builtin = builtin();
        let ctx = context(&builtin);
        let copy = ctx.duplicate().unwrap();
        assert_eq!(copy.repositories(), ctx.repositories());
        assert!(Arc::ptr_eq(copy.cache(), ctx.cache()));
        copy.close(false).unwrap();
        assert!(ctx.check().is_ok());
    }

    #[test]
    fn should_latch_failed_check() {
        let builtin = builtin();
        let ctx = context(&builtin);
        assert!(ctx.check().is_ok());
        builtin.set_token_present("second", false);
        assert!(ctx.check().is_err());
        assert_eq!(ctx.take_error().unwrap().action, "check");
    }

    #[test]
    fn should_not_duplicate_with_removed_token() {
        let builtin = builtin();
        let ctx = context(&builtin);
        builtin.set_token_present("second", false);
        assert!(ctx.duplicate().is_err());
    }

    #[test]
    fn should_close_and_finalize() {
        let builtin = builtin();
        let ctx = context(&builtin);
        ctx.close(true).unwrap();
        assert!(builtin.slots_with_token().is_err());
    }
}
