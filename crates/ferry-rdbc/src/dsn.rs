//! Connection URL building and parsing.
//!
//! URLs take the form `{kind}://{user}:{password}@{host}:{port}/{database}`
//! with an optional query string (`?driver=...&trust_cert=true`). Userinfo
//! is percent-encoded on the way in and decoded on the way out, so
//! passwords containing `@`, `:` or `/` survive the trip.

use std::fmt;

use crate::error::{Error, Result};
use crate::security::validate_url_component;

/// Decomposed connection URL
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionUrl {
    /// Connection kind, e.g. `postgresql+psycopg2`
    pub scheme: String,
    /// Host name or address
    pub host: String,
    /// TCP port, if given
    pub port: Option<u16>,
    /// Database name
    pub database: String,
    /// Login name (decoded)
    pub username: String,
    /// Password (decoded)
    pub password: Option<String>,
    /// Query parameters in order of appearance
    pub params: Vec<(String, String)>,
}

impl ConnectionUrl {
    /// Parse a URL, decoding the userinfo
    pub fn parse(raw: &str) -> Result<Self> {
        let url = url::Url::parse(raw)
            .map_err(|e| Error::config(format!("invalid connection URL: {}", e)))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::config("connection URL has no host"))?
            .to_string();

        let username = decode_component(url.username())?;
        let password = url.password().map(decode_component).transpose()?;
        let database = decode_component(url.path().trim_start_matches('/'))?;

        Ok(Self {
            scheme: url.scheme().to_string(),
            host,
            port: url.port(),
            database,
            username,
            password,
            params: url
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
        })
    }

    /// Render the URL, percent-encoding username, password and parameters.
    ///
    /// Host and database are validated instead of encoded: they may not
    /// contain URL delimiters.
    pub fn to_url_string(&self) -> Result<String> {
        validate_url_component("host", &self.host)?;
        if !self.database.is_empty() {
            validate_url_component("database", &self.database)?;
        }

        let base = format!("{}://{}", self.scheme, self.host);
        let mut url = url::Url::parse(&base)
            .map_err(|e| Error::config(format!("invalid connection URL: {}", e)))?;

        url.set_port(self.port)
            .map_err(|_| Error::config("cannot set port on connection URL"))?;
        if !self.username.is_empty() {
            url.set_username(&urlencoding::encode(&self.username))
                .map_err(|_| Error::config("cannot set username on connection URL"))?;
        }
        if let Some(password) = &self.password {
            url.set_password(Some(&urlencoding::encode(password)))
                .map_err(|_| Error::config("cannot set password on connection URL"))?;
        }
        url.set_path(&format!("/{}", self.database));
        if !self.params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in &self.params {
                pairs.append_pair(k, v);
            }
        }

        Ok(url.to_string())
    }

    /// First value of a query parameter
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

fn decode_component(raw: &str) -> Result<String> {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .map_err(|e| Error::config(format!("invalid percent-encoding in connection URL: {}", e)))
}

impl fmt::Debug for ConnectionUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionUrl")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("params", &self.params)
            .finish()
    }
}
