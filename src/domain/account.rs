//! Account profile used to place calls and register

use rsip::Uri;

/// Credentials attached to a profile. Carried for the registrar; this crate
/// does not answer digest challenges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub auth_user: String,
    pub password: String,
    pub realm: String,
}

/// Local identity of the user agent
#[derive(Debug, Clone)]
pub struct Profile {
    /// Address of record, e.g. `sip:100@127.0.0.1`
    pub uri: Uri,
    pub display_name: String,
    pub auth: AuthInfo,
    /// Registration lifetime in seconds
    pub expires: u32,
}

impl Profile {
    pub fn new(uri: Uri, display_name: impl Into<String>, auth: AuthInfo, expires: u32) -> Self {
        Self {
            uri,
            display_name: display_name.into(),
            auth,
            expires,
        }
    }

    /// User part of the address of record
    pub fn user(&self) -> String {
        self.uri
            .auth
            .as_ref()
            .map(|auth| auth.user.clone())
            .unwrap_or_else(|| self.auth.auth_user.clone())
    }

    /// `"Display" <sip:user@host>` as used in From/To headers
    pub fn name_addr(&self) -> String {
        if self.display_name.is_empty() {
            format!("<{}>", self.uri)
        } else {
            format!("\"{}\" <{}>", self.display_name, self.uri)
        }
    }
}

/// Outcome of a REGISTER exchange
#[derive(Debug, Clone)]
pub struct RegisterState {
    pub account: Profile,
    pub status_code: u16,
    pub reason: String,
    /// Granted lifetime in seconds, 0 once unregistered or on failure
    pub expiration: u32,
}

impl RegisterState {
    pub fn is_registered(&self) -> bool {
        (200..300).contains(&self.status_code) && self.expiration > 0
    }
}
