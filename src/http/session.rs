//! Signed-cookie sessions: a compact binary token (user id + expiry) sealed
//! with `cookie::Key`, restored into the request's extensions by middleware
//! so downstream handlers can trust `request.extensions().get::<Session>()`
//! without re-verifying the signature. Grounded in the teacher's
//! `examples/chat` session module.

use cookie::{Cookie, CookieJar, Key, SameSite};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::Result;

pub const COOKIE_NAME: &str = "plumage_session";
const TOKEN_BYTES: usize = 16 + 8;
const DEFAULT_TTL_SECS: u64 = 60 * 60 * 24 * 14;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Session {
    pub user_id: Uuid,
    expires_at: u64,
}

impl Session {
    pub fn new(user_id: Uuid) -> Self {
        let expires_at = now() + DEFAULT_TTL_SECS;
        Self { user_id, expires_at }
    }

    pub fn is_expired(&self) -> bool {
        now() >= self.expires_at
    }

    fn encode(&self) -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        bytes[..16].copy_from_slice(self.user_id.as_bytes());
        bytes[16..].copy_from_slice(&self.expires_at.to_be_bytes());

        base64_url_encode(&bytes)
    }

    fn decode(token: &str) -> Option<Self> {
        let bytes = base64_url_decode(token)?;
        if bytes.len() != TOKEN_BYTES {
            return None;
        }

        let user_id = Uuid::from_slice(&bytes[..16]).ok()?;
        let expires_at = u64::from_be_bytes(bytes[16..].try_into().ok()?);

        Some(Self { user_id, expires_at })
    }
}

/// Builds a private (encrypted + authenticated) cookie carrying `session`.
pub fn seal(key: &Key, session: Session) -> Cookie<'static> {
    let mut jar = CookieJar::new();
    let mut cookie = Cookie::new(COOKIE_NAME, session.encode());

    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_path("/");

    jar.private_mut(key).add(cookie);
    jar.get(COOKIE_NAME).cloned().expect("cookie was just inserted")
}

/// Verifies and decodes a session from a request's cookie jar, returning
/// `None` when absent, tampered with, or expired.
pub fn restore(key: &Key, jar: &CookieJar) -> Option<Session> {
    let mut private = jar.clone();
    let sealed = private.private_mut(key).get(COOKIE_NAME)?;
    let session = Session::decode(sealed.value())?;

    if session.is_expired() { None } else { Some(session) }
}

pub fn load_session_secret(raw: &str) -> Result<Key> {
    if raw.len() < 32 {
        crate::raise!(500, message = "SESSION_SECRET must be at least 32 bytes");
    }
    Ok(Key::derive_from(raw.as_bytes()))
}

fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn base64_url_encode(bytes: &[u8]) -> String {
    use base64_like::Alphabet;
    Alphabet::URL_SAFE_NO_PAD.encode(bytes)
}

fn base64_url_decode(input: &str) -> Option<Vec<u8>> {
    use base64_like::Alphabet;
    Alphabet::URL_SAFE_NO_PAD.decode(input)
}

/// A tiny, dependency-free base64 codec so session tokens do not pull in a
/// whole crate just for URL-safe, unpadded encoding of a 24-byte payload.
mod base64_like {
    const CHARS: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

    pub struct Alphabet;

    impl Alphabet {
        pub const URL_SAFE_NO_PAD: Alphabet = Alphabet;

        pub fn encode(&self, bytes: &[u8]) -> String {
            let mut out = String::with_capacity(bytes.len().div_ceil(3) * 4);

            for chunk in bytes.chunks(3) {
                let b0 = chunk[0] as u32;
                let b1 = *chunk.get(1).unwrap_or(&0) as u32;
                let b2 = *chunk.get(2).unwrap_or(&0) as u32;
                let triple = (b0 << 16) | (b1 << 8) | b2;

                out.push(CHARS[(triple >> 18 & 0x3f) as usize] as char);
                out.push(CHARS[(triple >> 12 & 0x3f) as usize] as char);
                if chunk.len() > 1 {
                    out.push(CHARS[(triple >> 6 & 0x3f) as usize] as char);
                }
                if chunk.len() > 2 {
                    out.push(CHARS[(triple & 0x3f) as usize] as char);
                }
            }

            out
        }

        pub fn decode(&self, input: &str) -> Option<Vec<u8>> {
            let value_of = |c: u8| CHARS.iter().position(|&x| x == c);
            let mut out = Vec::with_capacity(input.len() / 4 * 3 + 3);
            let chars: Vec<u8> = input.bytes().collect();

            for chunk in chars.chunks(4) {
                let mut values = [0u32; 4];
                for (i, &c) in chunk.iter().enumerate() {
                    values[i] = value_of(c)? as u32;
                }

                let triple = (values[0] << 18) | (values[1] << 12) | (values[2] << 6) | values[3];

                out.push((triple >> 16 & 0xff) as u8);
                if chunk.len() > 2 {
                    out.push((triple >> 8 & 0xff) as u8);
                }
                if chunk.len() > 3 {
                    out.push((triple & 0xff) as u8);
                }
            }

            Some(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_sealed_cookie() {
        let key = Key::generate();
        let session = Session::new(Uuid::new_v4());
        let cookie = seal(&key, session);

        let mut jar = CookieJar::new();
        jar.add_original(cookie);

        let restored = restore(&key, &jar).expect("session restores");
        assert_eq!(restored.user_id, session.user_id);
    }

    #[test]
    fn rejects_a_tampered_cookie() {
        let key = Key::generate();
        let other_key = Key::generate();
        let session = Session::new(Uuid::new_v4());
        let cookie = seal(&key, session);

        let mut jar = CookieJar::new();
        jar.add_original(cookie);

        assert!(restore(&other_key, &jar).is_none());
    }
}
