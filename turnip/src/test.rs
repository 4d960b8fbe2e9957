//! In-process stand-ins for the external authorisation service.
use std::sync::Mutex;

use crate::auth::AuthParams;
use crate::virtinfo::{Credentials, Error, Permission, Translated, VirtInfo};

/// A method invocation recorded by [`FakeVirtInfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    TranslatePath(String, &'static str),
    AuthenticateWithPassword(String, String),
    CheckRefPermissions(String, Vec<Vec<u8>>),
    Notify(String),
    ConfirmRepoCreation(String),
    AbortRepoCreation(String),
    GetMergeProposalUrl(String, String),
}

/// Scriptable authorisation service.
///
/// Every method records its invocation; the replies are whatever the test
/// installed.
pub struct FakeVirtInfo {
    pub translations: Mutex<Result<Translated, Error>>,
    pub credentials: Mutex<Result<Credentials, Error>>,
    pub ref_permissions: Mutex<Vec<(Vec<u8>, Vec<String>)>>,
    pub merge_proposal_url: Mutex<Option<String>>,
    pub confirmation: Mutex<Result<(), Error>>,
    pub calls: Mutex<Vec<Call>>,
}

impl FakeVirtInfo {
    pub fn new(translations: Result<Translated, Error>) -> Self {
        Self {
            translations: Mutex::new(translations),
            credentials: Mutex::new(Err(Error::Fault {
                code: 3,
                message: "Bad user or password".into(),
            })),
            ref_permissions: Mutex::new(vec![]),
            merge_proposal_url: Mutex::new(None),
            confirmation: Mutex::new(Ok(())),
            calls: Mutex::new(vec![]),
        }
    }

    pub fn translated(path: &str) -> Self {
        Self::new(Ok(Translated {
            path: path.to_owned(),
            writable: Some(true),
            ..Translated::default()
        }))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl VirtInfo for FakeVirtInfo {
    fn translate_path(
        &self,
        pathname: &str,
        permission: Permission,
        _auth: &AuthParams,
    ) -> Result<Translated, Error> {
        self.record(Call::TranslatePath(
            pathname.to_owned(),
            permission.as_str(),
        ));
        self.translations.lock().unwrap().clone()
    }

    fn authenticate_with_password(
        &self,
        user: &str,
        password: &str,
    ) -> Result<Credentials, Error> {
        self.record(Call::AuthenticateWithPassword(
            user.to_owned(),
            password.to_owned(),
        ));
        self.credentials.lock().unwrap().clone()
    }

    fn check_ref_permissions(
        &self,
        path: &str,
        refs: &[Vec<u8>],
        _auth: &AuthParams,
    ) -> Result<Vec<(Vec<u8>, Vec<String>)>, Error> {
        self.record(Call::CheckRefPermissions(path.to_owned(), refs.to_vec()));
        let known = self.ref_permissions.lock().unwrap();
        Ok(refs
            .iter()
            .map(|r| {
                let perms = known
                    .iter()
                    .find(|(name, _)| name == r)
                    .map(|(_, perms)| perms.clone())
                    .unwrap_or_default();
                (r.clone(), perms)
            })
            .collect())
    }

    fn notify(&self, path: &str) -> Result<(), Error> {
        self.record(Call::Notify(path.to_owned()));
        Ok(())
    }

    fn confirm_repo_creation(&self, path: &str, _auth: &AuthParams) -> Result<(), Error> {
        self.record(Call::ConfirmRepoCreation(path.to_owned()));
        self.confirmation.lock().unwrap().clone()
    }

    fn abort_repo_creation(&self, path: &str, _auth: &AuthParams) -> Result<(), Error> {
        self.record(Call::AbortRepoCreation(path.to_owned()));
        Ok(())
    }

    fn get_merge_proposal_url(
        &self,
        path: &str,
        branch: &str,
        _auth: &AuthParams,
    ) -> Result<Option<String>, Error> {
        self.record(Call::GetMergeProposalUrl(path.to_owned(), branch.to_owned()));
        Ok(self.merge_proposal_url.lock().unwrap().clone())
    }
}
