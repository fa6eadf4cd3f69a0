//! Basic-auth negotiation around a config download.

use crate::credential::{Credential, SecretBackend};
use crate::error::{Error, Result};
use crate::fetch::{ConfigFetcher, ConfigSource};

/// Asks the user for credentials.
pub trait CredentialPrompt: Send {
    /// `rejected` is set when the previous answer was refused by the server.
    /// `None` cancels the download.
    fn request(&self, origin: &str, rejected: bool) -> Option<Credential>;
}

/// A prompt that always cancels, for headless use.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrompt;

impl CredentialPrompt for NoPrompt {
    fn request(&self, _origin: &str, _rejected: bool) -> Option<Credential> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched(Vec<u8>),
    Cancelled,
}

/// One stage of the interactive credential loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    AwaitingCredential { rejected: bool },
    Verifying(Credential),
    Fetched(Vec<u8>),
    Cancelled,
}

pub struct AuthFlow<'a> {
    fetcher: &'a dyn ConfigFetcher,
    secrets: &'a dyn SecretBackend,
    prompt: &'a dyn CredentialPrompt,
}

impl<'a> AuthFlow<'a> {
    pub fn new(
        fetcher: &'a dyn ConfigFetcher,
        secrets: &'a dyn SecretBackend,
        prompt: &'a dyn CredentialPrompt,
    ) -> Self {
        Self {
            fetcher,
            secrets,
            prompt,
        }
    }

    /// Downloads `source`, negotiating credentials when the server asks.
    ///
    /// Order: anonymous, then the stored credential once, then the prompt
    /// until the user cancels or the server accepts.
    pub fn run(&self, source: &ConfigSource) -> Result<FetchOutcome> {
        let origin = match self.fetcher.fetch(source, None) {
            Ok(bytes) => return Ok(FetchOutcome::Fetched(bytes)),
            Err(Error::AuthRequired(origin)) => origin,
            Err(error) => return Err(error),
        };
        let target = source.auth_target();

        if let Some(target) = target.as_deref() {
            if let Some(cached) = self.secrets.try_read(target) {
                match self.fetcher.fetch(source, Some(&cached)) {
                    Ok(bytes) => return Ok(FetchOutcome::Fetched(bytes)),
                    Err(error) if error.is_auth() => {
                        tracing::info!(target: "fetch", %origin, "stored credential rejected, discarding");
                        if let Err(error) = self.secrets.delete(target) {
                            tracing::warn!(target: "fetch", %error, "stored credential could not be deleted");
                        }
                    }
                    Err(error) => return Err(error),
                }
            }
        }

        let mut step = AuthStep::AwaitingCredential { rejected: false };
        loop {
            step = match self.advance(source, &origin, target.as_deref(), step)? {
                AuthStep::Fetched(bytes) => return Ok(FetchOutcome::Fetched(bytes)),
                AuthStep::Cancelled => return Ok(FetchOutcome::Cancelled),
                next => next,
            };
        }
    }

    /// Performs the work of `step` and returns the step that follows it.
    pub fn advance(
        &self,
        source: &ConfigSource,
        origin: &str,
        target: Option<&str>,
        step: AuthStep,
    ) -> Result<AuthStep> {
        Ok(match step {
            AuthStep::AwaitingCredential { rejected } => match self.prompt.request(origin, rejected) {
                Some(credential) => AuthStep::Verifying(credential),
                None => AuthStep::Cancelled,
            },
            AuthStep::Verifying(credential) => match self.fetcher.fetch(source, Some(&credential)) {
                Ok(bytes) => {
                    if let Some(target) = target {
                        if let Err(error) = self.secrets.write(target, &credential) {
                            tracing::warn!(target: "fetch", %error, "accepted credential could not be stored");
                        }
                    }
                    AuthStep::Fetched(bytes)
                }
                Err(error) if error.is_auth() => AuthStep::AwaitingCredential { rejected: true },
                Err(error) => return Err(error),
            },
            done @ (AuthStep::Fetched(_) | AuthStep::Cancelled) => done,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::MemorySecretStore;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const TARGET: &str = "https://sub.example.com:443";

    /// Accepts exactly one credential, challenges everything else.
    struct BasicServer {
        accepted: Credential,
        calls: Mutex<Vec<Option<Credential>>>,
    }

    impl BasicServer {
        fn new(user: &str, secret: &str) -> Self {
            Self {
                accepted: Credential::new(user, secret),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Option<Credential>> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ConfigFetcher for BasicServer {
        fn fetch(&self, _source: &ConfigSource, credential: Option<&Credential>) -> Result<Vec<u8>> {
            self.calls.lock().unwrap().push(credential.cloned());
            match credential {
                None => Err(Error::AuthRequired(TARGET.into())),
                Some(c) if *c == self.accepted => Ok(b"{}".to_vec()),
                Some(_) => Err(Error::AuthInvalid(TARGET.into())),
            }
        }
    }

    struct ScriptedPrompt {
        answers: Mutex<VecDeque<Option<Credential>>>,
        asked: Mutex<Vec<bool>>,
    }

    impl ScriptedPrompt {
        fn new(answers: Vec<Option<Credential>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                asked: Mutex::new(Vec::new()),
            }
        }
    }

    impl CredentialPrompt for ScriptedPrompt {
        fn request(&self, origin: &str, rejected: bool) -> Option<Credential> {
            assert_eq!(origin, TARGET);
            self.asked.lock().unwrap().push(rejected);
            self.answers.lock().unwrap().pop_front().flatten()
        }
    }

    fn source() -> ConfigSource {
        ConfigSource::parse("https://sub.example.com/c.json").unwrap()
    }

    #[test]
    fn rejected_cache_is_deleted_before_prompting() {
        let server = BasicServer::new("alice", "right");
        let secrets = MemorySecretStore::new();
        secrets.write(TARGET, &Credential::new("alice", "stale")).unwrap();
        let prompt = ScriptedPrompt::new(vec![None]);

        let outcome = AuthFlow::new(&server, &secrets, &prompt).run(&source()).unwrap();
        assert_eq!(outcome, FetchOutcome::Cancelled);
        assert!(secrets.get(TARGET).is_none());
        assert_eq!(*prompt.asked.lock().unwrap(), [false]);
        assert_eq!(server.calls().len(), 2);
    }

    #[test]
    fn prompt_repeats_until_accepted_and_stores_answer() {
        let server = BasicServer::new("alice", "right");
        let secrets = MemorySecretStore::new();
        let prompt = ScriptedPrompt::new(vec![
            Some(Credential::new("alice", "wrong")),
            Some(Credential::new("alice", "right")),
        ]);

        let outcome = AuthFlow::new(&server, &secrets, &prompt).run(&source()).unwrap();
        assert_eq!(outcome, FetchOutcome::Fetched(b"{}".to_vec()));
        assert_eq!(*prompt.asked.lock().unwrap(), [false, true]);
        assert_eq!(secrets.get(TARGET), Some(Credential::new("alice", "right")));
    }

    #[test]
    fn cached_credential_is_used_without_prompt() {
        let server = BasicServer::new("alice", "right");
        let secrets = MemorySecretStore::new();
        secrets.write(TARGET, &Credential::new("alice", "right")).unwrap();
        let prompt = ScriptedPrompt::new(vec![]);

        let outcome = AuthFlow::new(&server, &secrets, &prompt).run(&source()).unwrap();
        assert!(matches!(outcome, FetchOutcome::Fetched(_)));
        assert!(prompt.asked.lock().unwrap().is_empty());
    }

    #[test]
    fn each_step_advances_independently() {
        let server = BasicServer::new("alice", "right");
        let secrets = MemorySecretStore::new();
        let prompt = ScriptedPrompt::new(vec![Some(Credential::new("bob", "x"))]);
        let flow = AuthFlow::new(&server, &secrets, &prompt);
        let src = source();

        let step = flow
            .advance(&src, TARGET, Some(TARGET), AuthStep::AwaitingCredential { rejected: false })
            .unwrap();
        assert_eq!(step, AuthStep::Verifying(Credential::new("bob", "x")));
        let step = flow.advance(&src, TARGET, Some(TARGET), step).unwrap();
        assert_eq!(step, AuthStep::AwaitingCredential { rejected: true });
        assert!(secrets.is_empty());
    }
}
