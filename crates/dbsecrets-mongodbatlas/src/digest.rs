//! HTTP Digest access authentication (RFC 7616, MD5 with `qop=auth`)

use md5::{Digest, Md5};
use rand::RngCore;

use dbsecrets_plugin::prelude::*;

/// A parsed `WWW-Authenticate: Digest ...` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    /// Protection space
    pub realm: String,
    /// Server nonce
    pub nonce: String,
    /// Opaque value echoed back to the server
    pub opaque: Option<String>,
    /// Whether the server offered `qop=auth`
    pub qop_auth: bool,
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

/// Split `k=v, k="v, with comma"` pairs
fn parameters(input: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some((key, tail)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let tail = tail.trim_start();
        let (value, remaining) = if let Some(quoted) = tail.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match tail.find(',') {
                Some(end) => (&tail[..end], &tail[end..]),
                None => (tail, ""),
            }
        };
        pairs.push((key, value.trim().to_string()));
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }
    pairs
}

impl DigestChallenge {
    /// Parse a `WWW-Authenticate` header value
    pub fn parse(header: &str) -> Result<Self> {
        let header = header.trim();
        let params = match header.split_once(char::is_whitespace) {
            Some((scheme, params)) if scheme.eq_ignore_ascii_case("digest") => params,
            _ => return Err(Error::reachability(format!("unsupported authentication challenge: {header}"))),
        };

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop_auth = false;
        for (key, value) in parameters(params) {
            match key.as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "qop" => qop_auth = value.split(',').any(|q| q.trim() == "auth"),
                "algorithm" if !value.eq_ignore_ascii_case("md5") => {
                    return Err(Error::reachability(format!(
                        "unsupported digest algorithm {value}"
                    )))
                }
                _ => {}
            }
        }

        Ok(Self {
            realm: realm.ok_or_else(|| Error::reachability("digest challenge without realm"))?,
            nonce: nonce.ok_or_else(|| Error::reachability("digest challenge without nonce"))?,
            opaque,
            qop_auth,
        })
    }

    /// `Authorization` header for one request
    pub fn authorization(
        &self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        nonce_count: u32,
        cnonce: &str,
    ) -> String {
        let ha1 = md5_hex(&format!("{username}:{}:{password}", self.realm));
        let ha2 = md5_hex(&format!("{method}:{uri}"));
        let nc = format!("{nonce_count:08x}");

        let mut header = format!(
            r#"Digest username="{username}", realm="{}", nonce="{}", uri="{uri}", algorithm=MD5"#,
            self.realm, self.nonce
        );
        let response = if self.qop_auth {
            header.push_str(&format!(r#", qop=auth, nc={nc}, cnonce="{cnonce}""#));
            md5_hex(&format!("{ha1}:{}:{nc}:{cnonce}:auth:{ha2}", self.nonce))
        } else {
            md5_hex(&format!("{ha1}:{}:{ha2}", self.nonce))
        };
        header.push_str(&format!(r#", response="{response}""#));
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(r#", opaque="{opaque}""#));
        }
        header
    }
}

/// Random client nonce
pub fn cnonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
