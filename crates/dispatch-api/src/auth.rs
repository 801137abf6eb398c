use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};

use crate::error::Error;

/// Session credentials for the dispatch backend.
///
/// The console authenticates every REST call and the push stream with the
/// same bearer token. The token itself is obtained by the surrounding
/// application (login flow, token refresh) and handed in here.
#[derive(Debug, Clone)]
pub struct Credentials {
    token: SecretString,
}

impl Credentials {
    pub fn bearer(token: SecretString) -> Self {
        Self { token }
    }

    pub fn token(&self) -> &SecretString {
        &self.token
    }

    /// Default headers carrying the `Authorization: Bearer …` value.
    ///
    /// The header is marked sensitive so it never shows up in debug output.
    pub fn headers(&self) -> Result<HeaderMap, Error> {
        bearer_headers(&self.token)
    }
}

/// Build the authorization header map for a bearer token.
pub fn bearer_headers(token: &SecretString) -> Result<HeaderMap, Error> {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
        .map_err(|e| Error::InvalidHeader(e.to_string()))?;
    value.set_sensitive(true);

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, value);
    Ok(headers)
}
