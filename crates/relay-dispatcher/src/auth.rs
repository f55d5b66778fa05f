//! HTTP Basic authentication for downstream nodes.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::{collections::HashMap, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    Missing,
    Invalid,
}

/// Accepted `user:password` pairs. An empty set disables downstream authentication.
#[derive(Clone, Default)]
pub struct DownstreamCredentials {
    users: HashMap<String, String>,
}

impl fmt::Debug for DownstreamCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut users: Vec<&str> = self.users.keys().map(String::as_str).collect();
        users.sort_unstable();
        f.debug_struct("DownstreamCredentials")
            .field("users", &users)
            .finish()
    }
}

impl DownstreamCredentials {
    /// Parse entries of the form `user:password`.
    pub fn parse<I, S>(entries: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut users = HashMap::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            let Some((user, password)) = entry.split_once(':') else {
                anyhow::bail!("downstream credential must be user:password");
            };
            if user.is_empty() {
                anyhow::bail!("downstream credential has an empty user name");
            }
            users.insert(user.to_string(), password.to_string());
        }
        Ok(Self { users })
    }

    pub fn is_enabled(&self) -> bool {
        !self.users.is_empty()
    }

    /// Authenticated user name, or `None` when authentication is disabled.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Option<String>, AuthFailure> {
        if !self.is_enabled() {
            return Ok(None);
        }

        let value = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthFailure::Missing)?;
        let encoded = value
            .strip_prefix("Basic ")
            .ok_or(AuthFailure::Invalid)?;
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|_| AuthFailure::Invalid)?;
        let decoded = String::from_utf8(decoded).map_err(|_| AuthFailure::Invalid)?;
        let (user, password) = decoded.split_once(':').ok_or(AuthFailure::Invalid)?;

        match self.users.get(user) {
            Some(expected) if expected == password => Ok(Some(user.to_string())),
            _ => Err(AuthFailure::Invalid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn basic(user: &str, password: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let token = STANDARD.encode(format!("{user}:{password}"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn accepts_configured_pair() {
        let creds = DownstreamCredentials::parse(["alice:s3cret", "bob:pw:with:colons"]).unwrap();
        assert_eq!(
            creds.authenticate(&basic("alice", "s3cret")),
            Ok(Some("alice".to_string()))
        );
        assert_eq!(
            creds.authenticate(&basic("bob", "pw:with:colons")),
            Ok(Some("bob".to_string()))
        );
    }

    #[test]
    fn rejects_missing_and_wrong_credentials() {
        let creds = DownstreamCredentials::parse(["alice:s3cret"]).unwrap();
        assert_eq!(creds.authenticate(&HeaderMap::new()), Err(AuthFailure::Missing));
        assert_eq!(
            creds.authenticate(&basic("alice", "nope")),
            Err(AuthFailure::Invalid)
        );
        assert_eq!(
            creds.authenticate(&basic("mallory", "s3cret")),
            Err(AuthFailure::Invalid)
        );
    }

    #[test]
    fn empty_set_disables_auth() {
        let creds = DownstreamCredentials::parse(Vec::<String>::new()).unwrap();
        assert!(!creds.is_enabled());
        assert_eq!(creds.authenticate(&HeaderMap::new()), Ok(None));
        assert!(DownstreamCredentials::parse(["nocolon"]).is_err());
        assert!(!format!("{creds:?}").contains("s3cret"));
    }
}
