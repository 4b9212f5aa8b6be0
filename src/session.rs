//! User identity resolution
//!
//! The gateway trusts an upstream authentication proxy to assert identity
//! through the X-Forwarded-User header; after the first login it also
//! carries its own HMAC-signed session cookie so later requests resolve
//! without the header. The cookie is `<user>.<hex hmac-sha256>` over the
//! configured secret. Anything malformed or tampered resolves to no user.

use hmac::{Hmac, Mac};
use hyper::Request;
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Name of the session cookie issued at login.
pub const SESSION_COOKIE: &str = "worldhub_session";

/// Identity header asserted by the upstream auth proxy.
pub const FORWARDED_USER: &str = "x-forwarded-user";

/// Maximum accepted user identity length.
const MAX_USER_LEN: usize = 64;

/// Resolves and mints session identities.
pub struct Sessions {
    secret: String,
}

impl Sessions {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Resolve the user identity for a request, if any.
    ///
    /// The forwarded header wins over the cookie so a re-login under a
    /// different identity takes effect immediately.
    pub fn resolve_user<B>(&self, req: &Request<B>) -> Option<String> {
        if let Some(user) = req
            .headers()
            .get(FORWARDED_USER)
            .and_then(|v| v.to_str().ok())
            .and_then(validate_user)
        {
            return Some(user);
        }

        let cookie_header = req
            .headers()
            .get(hyper::header::COOKIE)
            .and_then(|v| v.to_str().ok())?;

        let token = find_cookie(cookie_header, SESSION_COOKIE)?;
        self.verify_token(token)
    }

    /// Build the Set-Cookie value carrying a signed session for the user.
    pub fn issue_cookie(&self, user: &str) -> String {
        format!(
            "{}={}.{}; Path=/; HttpOnly; SameSite=Lax",
            SESSION_COOKIE,
            user,
            self.sign(user)
        )
    }

    fn sign(&self, user: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(user.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn verify_token(&self, token: &str) -> Option<String> {
        let (user, signature) = token.split_once('.')?;
        let user = validate_user(user)?;

        let raw_signature = hex::decode(signature).ok()?;
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(user.as_bytes());

        match mac.verify_slice(&raw_signature) {
            Ok(()) => Some(user),
            Err(_) => {
                debug!(user, "Session cookie signature mismatch");
                None
            }
        }
    }
}

/// Validate a user identity: non-empty, bounded length, and restricted to
/// characters safe for container names and log fields.
fn validate_user(raw: &str) -> Option<String> {
    if raw.is_empty() || raw.len() > MAX_USER_LEN {
        return None;
    }
    if !raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return None;
    }
    Some(raw.to_string())
}

/// Pull one cookie's value out of a Cookie header.
fn find_cookie<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value)
    })
}
