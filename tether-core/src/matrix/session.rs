use matrix_sdk::ruma::{OwnedUserId, UserId};
use reqwest::Url;

use crate::matrix::error::MatrixError;

/// Credentials for one logged-in account. Built by login or registration and
/// never mutated afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub homeserver: Url,
    pub user_id: OwnedUserId,
    pub access_token: String,
    pub device_id: Option<String>,
}

impl Session {
    pub fn new(
        homeserver: Url,
        user_id: OwnedUserId,
        access_token: impl Into<String>,
        device_id: Option<String>,
    ) -> Self {
        Self {
            homeserver,
            user_id,
            access_token: access_token.into(),
            device_id,
        }
    }

    /// `host` or `host:port` of the homeserver, for display.
    pub fn hostname(&self) -> String {
        let host = self.homeserver.host_str().unwrap_or_default();
        match self.homeserver.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        }
    }
}

// Keep the access token out of logs.
impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("homeserver", &self.homeserver.as_str())
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

/// Accept either a full MXID (`@alice:server`) or a bare localpart
/// (`alice`). For bare localparts the server name comes from the homeserver
/// URL.
pub fn normalize_user_id(username: &str, homeserver: &Url) -> Result<OwnedUserId, MatrixError> {
    let username = username.trim();
    let mxid = if username.starts_with('@') {
        username.to_owned()
    } else {
        let server = homeserver.host_str().unwrap_or("localhost");
        match homeserver.port() {
            Some(port) => format!("@{username}:{server}:{port}"),
            None => format!("@{username}:{server}"),
        }
    };

    UserId::parse(&mxid).map_err(|e| MatrixError::InvalidUserId(format!("{mxid}: {e}")))
}
