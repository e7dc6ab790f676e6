//! Deterministic cache keys.

use std::collections::{BTreeMap, HashSet};

use axum::http::Request;
use serde_json::Value;

use crate::http::request::request_target;

/// Builds `{method}{target}` followed by `|value` for every configured header and
/// `/value` for every configured claim, both in sorted name order.
///
/// Header names are compared lowercased on both sides, so the configured spelling
/// does not matter and neither does the casing used on the wire. A repeated header
/// contributes all of its values, joined with `,` in arrival order.
#[derive(Debug, Clone, Default)]
pub struct CacheKeyBuilder {
    key_headers: HashSet<String>,
    key_claims: HashSet<String>,
}

impl CacheKeyBuilder {
    pub fn new(key_headers: &[String], key_claims: &[String]) -> Self {
        Self {
            key_headers: key_headers
                .iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .collect(),
            key_claims: key_claims.iter().cloned().collect(),
        }
    }

    pub fn build<B>(&self, req: &Request<B>, claims: Option<&BTreeMap<String, Value>>) -> String {
        let mut key = format!("{}{}", req.method(), request_target(req));

        if !self.key_headers.is_empty() {
            let mut names: Vec<&str> = req
                .headers()
                .keys()
                .map(|name| name.as_str())
                .filter(|name| self.key_headers.contains(*name))
                .collect();
            names.sort_unstable();
            for name in names {
                key.push('|');
                for (i, value) in req.headers().get_all(name).iter().enumerate() {
                    if i > 0 {
                        key.push(',');
                    }
                    key.push_str(&String::from_utf8_lossy(value.as_bytes()));
                }
            }
        }

        // BTreeMap iterates in sorted claim order.
        if let Some(claims) = claims {
            for (name, value) in claims {
                if !self.key_claims.contains(name) {
                    continue;
                }
                key.push('/');
                match value {
                    Value::String(s) => key.push_str(s),
                    other => key.push_str(&other.to_string()),
                }
            }
        }

        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn builder() -> CacheKeyBuilder {
        CacheKeyBuilder::new(
            &["X-Tenant".to_string(), "accept-language".to_string()],
            &["sub".to_string(), "org".to_string()],
        )
    }

    #[test]
    fn test_header_order_does_not_matter() {
        let a = Request::builder()
            .uri("/items?page=2")
            .header("x-tenant", "acme")
            .header("accept-language", "it")
            .header("user-agent", "curl")
            .body(Body::empty())
            .unwrap();
        let b = Request::builder()
            .uri("/items?page=2")
            .header("user-agent", "wget")
            .header("Accept-Language", "it")
            .header("X-TENANT", "acme")
            .body(Body::empty())
            .unwrap();

        let key = builder().build(&a, None);
        assert_eq!(key, builder().build(&b, None));
        assert_eq!(key, "GET/items?page=2|it|acme");
    }

    #[test]
    fn test_repeated_header_values_all_count() {
        let single = Request::builder()
            .uri("/items")
            .header("accept-language", "it")
            .body(Body::empty())
            .unwrap();
        let repeated = Request::builder()
            .uri("/items")
            .header("accept-language", "it")
            .header("accept-language", "en")
            .body(Body::empty())
            .unwrap();

        let key = builder().build(&repeated, None);
        assert_eq!(key, "GET/items|it,en");
        assert_ne!(key, builder().build(&single, None));
    }

    #[test]
    fn test_claims_are_sorted_and_filtered() {
        let req = Request::builder()
            .method("POST")
            .uri("/x")
            .body(Body::empty())
            .unwrap();
        let mut claims = BTreeMap::new();
        claims.insert("sub".to_string(), Value::from("u1"));
        claims.insert("org".to_string(), Value::from(42));
        claims.insert("email".to_string(), Value::from("u1@example.com"));

        assert_eq!(builder().build(&req, Some(&claims)), "POST/x/42/u1");
        assert_eq!(builder().build(&req, None), "POST/x");
    }

    #[test]
    fn test_method_and_target_distinguish_keys() {
        let get = Request::builder().uri("/a?x=1").body(Body::empty()).unwrap();
        let head = Request::builder()
            .method("HEAD")
            .uri("/a?x=1")
            .body(Body::empty())
            .unwrap();
        let other = Request::builder().uri("/a?x=2").body(Body::empty()).unwrap();
        let keys = CacheKeyBuilder::default();
        assert_ne!(keys.build(&get, None), keys.build(&head, None));
        assert_ne!(keys.build(&get, None), keys.build(&other, None));
    }
}
