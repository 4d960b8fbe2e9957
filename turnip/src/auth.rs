//! Authentication parameters passed through to the authorisation service.
//!
//! Frontends that can authenticate a caller record the outcome in
//! `turnip-authenticated-*` request parameters; the proxy and the backend
//! decode those into an opaque parameter set for every authorisation call.
use std::collections::BTreeMap;

use crate::request::{params, Params};

const AUTHENTICATED_PREFIX: &str = "turnip-authenticated-";

/// Caller identity and request metadata, as the authorisation service
/// expects it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthParams {
    pub user: Option<String>,
    pub uid: Option<i64>,
    /// Any other `turnip-authenticated-*` parameter, keyed by its suffix.
    pub extra: BTreeMap<String, String>,
    pub can_authenticate: bool,
    pub request_id: Option<String>,
}

impl AuthParams {
    /// Decode from request parameters.
    pub fn from_params(request_params: &Params, request_id: Option<&str>) -> Self {
        let mut auth = AuthParams {
            request_id: request_id.map(ToOwned::to_owned),
            ..AuthParams::default()
        };
        for (name, value) in request_params {
            let Some(key) = name.strip_prefix(AUTHENTICATED_PREFIX) else {
                continue;
            };
            let value = String::from_utf8_lossy(value).into_owned();
            match key {
                "user" => auth.user = Some(value),
                "uid" => auth.uid = value.parse().ok(),
                _ => {
                    auth.extra.insert(key.to_owned(), value);
                }
            }
        }
        if request_params.get(params::CAN_AUTHENTICATE).map(Vec::as_slice) == Some(b"yes")
        {
            auth.can_authenticate = true;
        }
        auth
    }
}
