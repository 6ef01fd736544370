//! RTSP authentication: Basic (RFC 7617) and Digest (RFC 2069, `MD5`).
//!
//! The client answers a `WWW-Authenticate` challenge with
//!
//! ```text
//! HA1      = MD5(username:realm:password)
//! HA2      = MD5(method:uri)
//! response = MD5(HA1:nonce:HA2)
//! ```
//!
//! and the server recomputes the same value to verify it.

use base64::prelude::{BASE64_STANDARD, Engine as _};
use md5::{Digest, Md5};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Digest,
}

/// A parsed `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: AuthScheme,
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
}

impl Challenge {
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, rest) = header.trim().split_once(' ').unwrap_or((header.trim(), ""));
        let scheme = if scheme.eq_ignore_ascii_case("digest") {
            AuthScheme::Digest
        } else if scheme.eq_ignore_ascii_case("basic") {
            AuthScheme::Basic
        } else {
            return None;
        };
        let params = parse_params(rest);
        let get = |key: &str| {
            params
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.clone())
        };
        let challenge = Self {
            scheme,
            realm: get("realm").unwrap_or_default(),
            nonce: get("nonce").unwrap_or_default(),
            opaque: get("opaque"),
        };
        if challenge.scheme == AuthScheme::Digest && challenge.nonce.is_empty() {
            return None;
        }
        Some(challenge)
    }

    /// Pick the strongest challenge among several `WWW-Authenticate` values.
    pub fn select<'a>(headers: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let mut best: Option<Self> = None;
        for c in headers.into_iter().filter_map(Self::parse) {
            if c.scheme == AuthScheme::Digest {
                return Some(c);
            }
            best.get_or_insert(c);
        }
        best
    }

    /// `Authorization` header value answering this challenge.
    pub fn authorization(&self, username: &str, password: &str, method: &str, uri: &str) -> String {
        match self.scheme {
            AuthScheme::Basic => format!(
                "Basic {}",
                BASE64_STANDARD.encode(format!("{username}:{password}"))
            ),
            AuthScheme::Digest => {
                let response = digest_response(username, &self.realm, password, &self.nonce, method, uri);
                let mut v = format!(
                    "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", response=\"{response}\", algorithm=\"MD5\"",
                    self.realm, self.nonce
                );
                if let Some(opaque) = &self.opaque {
                    v.push_str(&format!(", opaque=\"{opaque}\""));
                }
                v
            }
        }
    }
}

fn md5_hex(s: &str) -> String {
    format!("{:x}", Md5::digest(s.as_bytes()))
}

pub fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    method: &str,
    uri: &str,
) -> String {
    let ha1 = md5_hex(&format!("{username}:{realm}:{password}"));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    md5_hex(&format!("{ha1}:{nonce}:{ha2}"))
}

/// `key=value` pairs separated by commas; values may be quoted and quoted
/// values may contain commas.
fn parse_params(s: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = s.trim();
    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_string();
        let after = after.trim_start();
        let (value, tail) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };
        params.push((key, value.trim().to_string()));
        rest = tail.trim_start().trim_start_matches(',').trim_start();
    }
    params
}

/// Server-side Digest check with one fixed nonce per server.
#[derive(Debug, Clone)]
pub struct DigestAuthenticator {
    realm: String,
    username: String,
    password: String,
    nonce: String,
}

impl DigestAuthenticator {
    pub fn new(realm: &str, username: &str, password: &str) -> Self {
        Self {
            realm: realm.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            nonce: format!("{:016x}", rand::random::<u64>()),
        }
    }

    /// Value for the `WWW-Authenticate` header of a 401.
    pub fn challenge(&self) -> String {
        format!("Digest realm=\"{}\", nonce=\"{}\"", self.realm, self.nonce)
    }

    /// Whether `authorization` is a valid answer for `method`.
    pub fn verify(&self, method: &str, authorization: Option<&str>) -> bool {
        let Some(value) = authorization else {
            return false;
        };
        let Some(rest) = value
            .trim()
            .strip_prefix("Digest ")
            .or_else(|| value.trim().strip_prefix("digest "))
        else {
            return false;
        };
        let params = parse_params(rest);
        let get = |key: &str| {
            params
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.as_str())
        };
        let (Some(username), Some(realm), Some(nonce), Some(uri), Some(response)) = (
            get("username"),
            get("realm"),
            get("nonce"),
            get("uri"),
            get("response"),
        ) else {
            return false;
        };
        if username != self.username || realm != self.realm || nonce != self.nonce {
            return false;
        }
        let expected = digest_response(username, realm, &self.password, nonce, method, uri);
        expected.eq_ignore_ascii_case(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_digest_challenge() {
        let c = Challenge::parse(r#"Digest realm="r", nonce="n", stale="FALSE""#).unwrap();
        assert_eq!(c.scheme, AuthScheme::Digest);
        assert_eq!(c.realm, "r");
        assert_eq!(c.nonce, "n");
    }

    #[test]
    fn quoted_values_may_contain_commas() {
        let p = parse_params(r#"realm="a, b", nonce=xyz, opaque="o""#);
        assert_eq!(
            p,
            vec![
                ("realm".to_string(), "a, b".to_string()),
                ("nonce".to_string(), "xyz".to_string()),
                ("opaque".to_string(), "o".to_string()),
            ]
        );
    }

    #[test]
    fn digest_answer_matches_rfc_formula() {
        let uri = "rtsp://127.0.0.1/live/test";
        let c = Challenge::parse(r#"Digest realm="r", nonce="n""#).unwrap();
        let header = c.authorization("u", "p", "OPTIONS", uri);

        let ha1 = md5_hex("u:r:p");
        let ha2 = md5_hex(&format!("OPTIONS:{uri}"));
        let response = md5_hex(&format!("{ha1}:n:{ha2}"));
        assert_eq!(
            header,
            format!(
                r#"Digest username="u", realm="r", nonce="n", uri="{uri}", response="{response}", algorithm="MD5""#
            )
        );
    }

    #[test]
    fn basic_answer() {
        let c = Challenge::parse(r#"Basic realm="r""#).unwrap();
        assert_eq!(c.authorization("u", "p", "DESCRIBE", "rtsp://h/"), "Basic dTpw");
    }

    #[test]
    fn digest_is_preferred() {
        let c = Challenge::select([r#"Basic realm="r""#, r#"Digest realm="r", nonce="n""#]).unwrap();
        assert_eq!(c.scheme, AuthScheme::Digest);
        assert!(Challenge::select(["Bearer x"]).is_none());
    }

    #[test]
    fn server_verifies_client_answer() {
        let auth = DigestAuthenticator::new("streamcore", "admin", "secret");
        let challenge = Challenge::parse(&auth.challenge()).unwrap();

        let good = challenge.authorization("admin", "secret", "DESCRIBE", "rtsp://h/live/a");
        assert!(auth.verify("DESCRIBE", Some(&good)));
        assert!(!auth.verify("SETUP", Some(&good)));

        let bad = challenge.authorization("admin", "wrong", "DESCRIBE", "rtsp://h/live/a");
        assert!(!auth.verify("DESCRIBE", Some(&bad)));
        assert!(!auth.verify("DESCRIBE", None));
    }
}
