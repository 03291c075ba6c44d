//! Encrypted, authenticated cookie values.
//!
//! Cookie contents are sealed with the `cookie` crate's private jar
//! (AES-256-GCM, cookie name as associated data). Anything that fails to
//! open, whether tampered with, truncated or sealed under another key, reads
//! as absent.

use tower_cookies::cookie::{CookieJar, SameSite};
use tower_cookies::{Cookie, Cookies, Key};
use tracing::debug;

const LOG_TARGET: &str = "console::session::codec";

/// Attributes shared by every session cookie.
#[derive(Debug, Clone)]
pub struct CookieSettings {
    pub path: String,
    pub secure: bool,
    pub max_age: time::Duration,
}

impl Default for CookieSettings {
    fn default() -> Self {
        Self {
            path: "/".to_owned(),
            secure: false,
            max_age: time::Duration::days(30),
        }
    }
}

#[derive(Clone)]
pub struct CookieCodec {
    key: Key,
    settings: CookieSettings,
    same_site: SameSite,
}

impl CookieCodec {
    pub fn new(key: Key, settings: CookieSettings, same_site: SameSite) -> Self {
        Self {
            key,
            settings,
            same_site,
        }
    }

    pub fn settings(&self) -> &CookieSettings {
        &self.settings
    }

    fn build(&self, name: &'static str, value: String) -> Cookie<'static> {
        Cookie::build((name, value))
            .path(self.settings.path.clone())
            .http_only(true)
            .secure(self.settings.secure)
            .same_site(self.same_site)
            .max_age(self.settings.max_age)
            .build()
    }

    /// Decrypted value of the named request cookie.
    pub fn read(&self, cookies: &Cookies, name: &str) -> Option<String> {
        let value = cookies.private(&self.key).get(name).map(|c| c.value().to_owned());
        if value.is_none() && cookies.get(name).is_some() {
            debug!(target: LOG_TARGET, %name, "Cookie failed authentication, ignoring");
        }
        value.filter(|value| !value.is_empty())
    }

    pub fn write(&self, cookies: &Cookies, name: &'static str, value: String) {
        cookies.private(&self.key).add(self.build(name, value));
    }

    /// Expire the named cookie in the browser.
    pub fn clear(&self, cookies: &Cookies, name: &'static str) {
        let mut cookie = self.build(name, String::new());
        cookie.make_removal();
        cookies.add(cookie);
    }

    /// Seal an arbitrary payload for storage outside of a cookie.
    ///
    /// `purpose` binds the sealed value the same way a cookie name does; it
    /// must match on [`Self::unseal`].
    pub fn seal(&self, purpose: &str, payload: String) -> Option<String> {
        let mut jar = CookieJar::new();
        jar.private_mut(&self.key)
            .add(Cookie::new(purpose.to_owned(), payload));
        jar.get(purpose).map(|c| c.value().to_owned())
    }

    pub fn unseal(&self, purpose: &str, sealed: &str) -> Option<String> {
        let mut jar = CookieJar::new();
        jar.add_original(Cookie::new(purpose.to_owned(), sealed.to_owned()));
        jar.private(&self.key).get(purpose).map(|c| c.value().to_owned())
    }
}
