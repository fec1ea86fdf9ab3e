//! HTTP Basic Authentication against a credential given in the environment.
//!
//! The credential has the form `userpass:<user>:<password>`, as in the `CAMLI_AUTH`
//! environment variable.
use std::env;
use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::Error;

pub const AUTH_ENV: &str = "CAMLI_AUTH";

#[derive(Clone, PartialEq, Eq)]
pub struct AuthSpec {
    pub user: String,
    password: String,
}

impl FromStr for AuthSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<AuthSpec, Error> {
        let mut auth_fields = s.splitn(3, ':');
        let mode = auth_fields.next().unwrap_or("");
        if mode != "userpass" {
            return Err(Error::Config(format!("unsupported auth mode {:?}", mode)));
        }
        match (auth_fields.next(), auth_fields.next()) {
            (Some(user), Some(password)) if !user.is_empty() => Ok(AuthSpec {
                user: user.to_string(),
                password: password.to_string(),
            }),
            _ => Err(Error::Config(String::from("auth string malformed"))),
        }
    }
}

impl fmt::Debug for AuthSpec {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "userpass {}", self.user)
    }
}

impl AuthSpec {
    /// Credentials from [AUTH_ENV], if set and non-empty.
    pub fn from_env() -> Result<Option<AuthSpec>, Error> {
        match env::var(AUTH_ENV) {
            Ok(v) if !v.is_empty() => Ok(Some(AuthSpec::from_str(&v)?)),
            _ => Ok(None),
        }
    }

    /// Whether an `Authorization` header value carries these credentials.
    pub fn check(&self, header: Option<&str>) -> bool {
        let v = match header {
            Some(v) => v.trim(),
            None => return false,
        };
        let (scheme, payload) = match v.split_once(' ') {
            Some(p) => p,
            None => return false,
        };
        if !scheme.eq_ignore_ascii_case("basic") {
            return false;
        }
        let decoded = match STANDARD.decode(payload.trim()) {
            Ok(b) => b,
            Err(_) => return false,
        };
        let decoded = String::from_utf8_lossy(&decoded);
        match decoded.split_once(':') {
            Some((user, password)) => user == self.user && password == self.password,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    use super::AuthSpec;
    use crate::error::Error;

    #[test]
    fn test_auth_spec_parse() {
        let a = AuthSpec::from_str("userpass:alice:s3:cret").unwrap();
        assert_eq!(a.user, "alice");
        assert!(AuthSpec::from_str("token:abc").is_err());
        assert!(AuthSpec::from_str("userpass:alice").is_err());
        assert!(AuthSpec::from_str("userpass::x").is_err());
        match AuthSpec::from_str("token:abc") {
            Err(Error::Config(_)) => {},
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_auth_check() {
        let a = AuthSpec::from_str("userpass:alice:s3:cret").unwrap();
        let good = format!("Basic {}", STANDARD.encode("alice:s3:cret"));
        let bad = format!("Basic {}", STANDARD.encode("alice:nope"));
        assert!(a.check(Some(&good)));
        assert!(!a.check(Some(&bad)));
        assert!(!a.check(Some("Bearer xyz")));
        assert!(!a.check(Some("Basic !!!")));
        assert!(!a.check(None));
    }
}
