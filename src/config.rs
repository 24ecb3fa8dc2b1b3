//! Startup configuration, loaded once from the environment. Grounded in the
//! teacher's `examples/chat` `require_env`/`load_session_secret` helpers.

use cookie::Key;
use std::env::{self, VarError};
use std::net::SocketAddr;

use crate::error::Result;
use crate::http::session;

pub struct Config {
    pub addr: SocketAddr,
    pub database_url: String,
    pub redis_url: String,
    pub session_key: Key,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port: u16 = env::var("PORT")
            .ok()
            .map(|value| {
                value
                    .parse()
                    .map_err(|_| crate::err!(500, message = format!("PORT is not a valid port: {value}")))
            })
            .transpose()?
            .unwrap_or(10001);

        let database_url = require_env("DATABASE_URL")?;
        let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_owned());
        let secret = require_env("SESSION_SECRET")?;

        Ok(Self {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
            database_url,
            redis_url,
            session_key: session::load_session_secret(&secret)?,
        })
    }
}

pub fn require_env(var: &str) -> Result<String> {
    env::var(var).map_err(|error| match error {
        VarError::NotPresent => crate::err!(500, message = format!("missing required env var: {var}")),
        VarError::NotUnicode(_) => crate::err!(500, message = format!("env var \"{var}\" is not valid UTF-8")),
    })
}
