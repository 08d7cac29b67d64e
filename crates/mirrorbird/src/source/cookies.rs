//! Browser cookie bundle consumed by the source adapter.
//!
//! The bundle arrives as a JSON array in which each entry is either a
//! serialized cookie string (`"name=value; Domain=…; Path=…"`) or an object
//! (`{"name"|"key", "value", "domain", "path"?}`). Domains naming the
//! platform's vanity host are rewritten to the canonical API domain during
//! normalisation, and the rewrite count is kept for operator reporting.

use std::collections::BTreeMap;

use serde_json::Value;

use super::SourceError;

/// Cookie names the adapter cannot authenticate without.
pub const REQUIRED_COOKIES: [&str; 2] = ["auth_token", "ct0"];

const REWRITE_FROM: [&str; 2] = ["x.com", ".x.com"];
const REWRITE_TO: &str = ".twitter.com";

/// A single normalised cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
}

/// An `(auth_token, ct0)` credential pair usable for one authenticated
/// request identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPair {
    pub auth_token: String,
    pub ct0: String,
}

/// Parsed and normalised cookie bundle.
#[derive(Debug, Clone)]
pub struct CookieBundle {
    cookies: Vec<Cookie>,
    rewritten_domains: usize,
}

impl CookieBundle {
    /// Parse `SOURCE_COOKIES_JSON`. Fails on malformed JSON, malformed
    /// entries, or a bundle missing `auth_token` / `ct0`.
    pub fn parse(json: &str) -> Result<Self, SourceError> {
        let raw: Value = serde_json::from_str(json)
            .map_err(|e| SourceError::cookies(format!("invalid JSON: {e}")))?;
        let entries = raw
            .as_array()
            .ok_or_else(|| SourceError::cookies("expected a JSON array of cookie entries"))?;

        let mut cookies = Vec::with_capacity(entries.len());
        let mut rewritten_domains = 0usize;
        for (index, entry) in entries.iter().enumerate() {
            let mut cookie = match entry {
                Value::String(s) => parse_serialized(s)
                    .ok_or_else(|| SourceError::cookies(format!("entry {index}: bad cookie string")))?,
                Value::Object(_) => parse_object(entry)
                    .ok_or_else(|| SourceError::cookies(format!("entry {index}: bad cookie object")))?,
                _ => {
                    return Err(SourceError::cookies(format!(
                        "entry {index}: expected string or object"
                    )));
                }
            };
            if let Some(domain) = cookie.domain.as_deref() {
                if REWRITE_FROM.contains(&domain) {
                    cookie.domain = Some(REWRITE_TO.to_string());
                    rewritten_domains += 1;
                }
            }
            cookies.push(cookie);
        }

        let bundle = Self {
            cookies,
            rewritten_domains,
        };
        for name in REQUIRED_COOKIES {
            if bundle.get(name).is_none() {
                return Err(SourceError::cookies(format!("missing required cookie {name:?}")));
            }
        }
        Ok(bundle)
    }

    /// First cookie with the given name, across all domains.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    /// Number of cookies in the bundle.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// How many cookie domains were rewritten to the canonical API domain.
    #[must_use]
    pub fn rewritten_domains(&self) -> usize {
        self.rewritten_domains
    }

    /// Guest token, when the bundle carries one.
    #[must_use]
    pub fn guest_token(&self) -> Option<&str> {
        self.get("gt").map(|c| c.value.as_str())
    }

    /// All usable `(auth_token, ct0)` pairs: one per domain that carries
    /// both cookies, plus the flat name-indexed pair, duplicates collapsed.
    #[must_use]
    pub fn auth_pairs(&self) -> Vec<AuthPair> {
        let mut by_domain: BTreeMap<&str, (Option<&str>, Option<&str>)> = BTreeMap::new();
        for cookie in &self.cookies {
            let Some(domain) = cookie.domain.as_deref() else {
                continue;
            };
            let slot = by_domain.entry(domain).or_default();
            match cookie.name.as_str() {
                "auth_token" if slot.0.is_none() => slot.0 = Some(&cookie.value),
                "ct0" if slot.1.is_none() => slot.1 = Some(&cookie.value),
                _ => {}
            }
        }

        let mut pairs: Vec<AuthPair> = Vec::new();
        for (auth_token, ct0) in by_domain.values() {
            if let (Some(auth_token), Some(ct0)) = (auth_token, ct0) {
                push_unique(&mut pairs, auth_token, ct0);
            }
        }
        if let (Some(auth_token), Some(ct0)) = (self.get("auth_token"), self.get("ct0")) {
            push_unique(&mut pairs, &auth_token.value, &ct0.value);
        }
        pairs
    }

    /// Cookie header for one request identity: the pair's credentials first,
    /// then every other cookie by first occurrence of its name.
    #[must_use]
    pub fn header_for(&self, pair: &AuthPair) -> String {
        let mut parts = vec![
            format!("auth_token={}", pair.auth_token),
            format!("ct0={}", pair.ct0),
        ];
        let mut seen: Vec<&str> = vec!["auth_token", "ct0"];
        for cookie in &self.cookies {
            if seen.contains(&cookie.name.as_str()) {
                continue;
            }
            seen.push(&cookie.name);
            parts.push(format!("{}={}", cookie.name, cookie.value));
        }
        parts.join("; ")
    }
}

fn push_unique(pairs: &mut Vec<AuthPair>, auth_token: &str, ct0: &str) {
    if !pairs
        .iter()
        .any(|p| p.auth_token == auth_token && p.ct0 == ct0)
    {
        pairs.push(AuthPair {
            auth_token: auth_token.to_string(),
            ct0: ct0.to_string(),
        });
    }
}

/// Parse a `Set-Cookie`-style serialized entry. The first `name=value` pair
/// is the cookie; later segments are attributes.
fn parse_serialized(raw: &str) -> Option<Cookie> {
    let mut segments = raw.split(';').map(str::trim).filter(|s| !s.is_empty());
    let (name, value) = segments.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut cookie = Cookie {
        name: name.to_string(),
        value: value.trim().to_string(),
        domain: None,
        path: None,
    };
    for segment in segments {
        let (key, val) = match segment.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            // Valueless attributes (Secure, HttpOnly) carry nothing we need.
            None => continue,
        };
        if key.eq_ignore_ascii_case("domain") {
            cookie.domain = Some(val.to_string());
        } else if key.eq_ignore_ascii_case("path") {
            cookie.path = Some(val.to_string());
        }
    }
    Some(cookie)
}

fn parse_object(entry: &Value) -> Option<Cookie> {
    let name = entry
        .get("name")
        .or_else(|| entry.get("key"))?
        .as_str()?
        .to_string();
    if name.is_empty() {
        return None;
    }
    Some(Cookie {
        name,
        value: entry.get("value")?.as_str()?.to_string(),
        domain: entry.get("domain").and_then(Value::as_str).map(String::from),
        path: entry.get("path").and_then(Value::as_str).map(String::from),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(json: &str) -> CookieBundle {
        CookieBundle::parse(json).expect("bundle should parse")
    }

    #[test]
    fn parses_object_entries() {
        let b = bundle(
            r#"[
                {"name": "auth_token", "value": "tok", "domain": ".twitter.com", "path": "/"},
                {"key": "ct0", "value": "csrf", "domain": ".twitter.com"}
            ]"#,
        );
        assert_eq!(b.len(), 2);
        assert_eq!(b.get("auth_token").unwrap().value, "tok");
        assert_eq!(b.get("ct0").unwrap().path, None);
    }

    #[test]
    fn parses_serialized_entries() {
        let b = bundle(
            r#"["auth_token=tok; Domain=.twitter.com; Path=/; Secure; HttpOnly",
                "ct0=csrf; domain=.twitter.com"]"#,
        );
        let auth = b.get("auth_token").unwrap();
        assert_eq!(auth.value, "tok");
        assert_eq!(auth.domain.as_deref(), Some(".twitter.com"));
        assert_eq!(auth.path.as_deref(), Some("/"));
        assert_eq!(b.get("ct0").unwrap().domain.as_deref(), Some(".twitter.com"));
    }

    #[test]
    fn rewrites_vanity_domains_and_counts() {
        let b = bundle(
            r#"[
                {"name": "auth_token", "value": "tok", "domain": ".x.com"},
                {"name": "ct0", "value": "csrf", "domain": "x.com"},
                {"name": "lang", "value": "en", "domain": ".twitter.com"}
            ]"#,
        );
        assert_eq!(b.rewritten_domains(), 2);
        assert_eq!(b.get("auth_token").unwrap().domain.as_deref(), Some(".twitter.com"));
        assert_eq!(b.get("ct0").unwrap().domain.as_deref(), Some(".twitter.com"));
    }

    #[test]
    fn rejects_missing_required_cookies() {
        let err = CookieBundle::parse(r#"[{"name": "lang", "value": "en"}]"#)
            .expect_err("must require auth cookies");
        assert!(err.to_string().contains("auth_token"));
    }

    #[test]
    fn rejects_malformed_bundles() {
        assert!(CookieBundle::parse("not json").is_err());
        assert!(CookieBundle::parse(r#"{"name": "x"}"#).is_err());
        assert!(CookieBundle::parse("[42]").is_err());
        assert!(CookieBundle::parse(r#"["no-equals-sign"]"#).is_err());
    }

    #[test]
    fn auth_pairs_collapse_duplicates() {
        // Same credentials visible per-domain and via the flat lookup.
        let b = bundle(
            r#"[
                {"name": "auth_token", "value": "tok", "domain": ".twitter.com"},
                {"name": "ct0", "value": "csrf", "domain": ".twitter.com"}
            ]"#,
        );
        assert_eq!(
            b.auth_pairs(),
            vec![AuthPair {
                auth_token: "tok".into(),
                ct0: "csrf".into()
            }]
        );
    }

    #[test]
    fn auth_pairs_include_each_domain_identity() {
        let b = bundle(
            r#"[
                {"name": "auth_token", "value": "tok-a", "domain": ".twitter.com"},
                {"name": "ct0", "value": "csrf-a", "domain": ".twitter.com"},
                {"name": "auth_token", "value": "tok-b", "domain": ".example.com"},
                {"name": "ct0", "value": "csrf-b", "domain": ".example.com"}
            ]"#,
        );
        let pairs = b.auth_pairs();
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().any(|p| p.auth_token == "tok-a"));
        assert!(pairs.iter().any(|p| p.auth_token == "tok-b"));
    }

    #[test]
    fn header_carries_pair_then_remaining_cookies() {
        let b = bundle(
            r#"[
                {"name": "auth_token", "value": "tok", "domain": ".twitter.com"},
                {"name": "ct0", "value": "csrf", "domain": ".twitter.com"},
                {"name": "lang", "value": "en", "domain": ".twitter.com"}
            ]"#,
        );
        let pair = &b.auth_pairs()[0];
        assert_eq!(b.header_for(pair), "auth_token=tok; ct0=csrf; lang=en");
    }

    #[test]
    fn guest_token_comes_from_gt_cookie() {
        let b = bundle(
            r#"[
                {"name": "auth_token", "value": "tok"},
                {"name": "ct0", "value": "csrf"},
                {"name": "gt", "value": "1789"}
            ]"#,
        );
        assert_eq!(b.guest_token(), Some("1789"));
    }
}
