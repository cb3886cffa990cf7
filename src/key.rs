use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::error::{RateLimitError, Result};

/// Maximum canonical fingerprint length before it is collapsed into a
/// content hash. The guaranteed overall key length of ≤256 bytes leaves
/// headroom for the `"<prefix>:<algo>:"` wrapper applied in `storage_key`.
const MAX_FINGERPRINT_BYTES: usize = 200;

/// Caller-specific data passed to a key selector function. Kept
/// deliberately minimal and owned, so it can be constructed cheaply by
/// host glue without depending on any particular HTTP framework's types.
#[derive(Debug, Clone, Default)]
pub struct KeyContext {
    pub client_address: Option<String>,
    pub authenticated_principal: Option<String>,
    pub path: Option<String>,
    pub custom: Vec<(String, String)>,
}

impl KeyContext {
    pub fn get(&self, selector: &str) -> Option<&str> {
        match selector {
            "client-address" => self.client_address.as_deref(),
            "authenticated-principal" => self.authenticated_principal.as_deref(),
            "path" => self.path.as_deref(),
            other => self
                .custom
                .iter()
                .find(|(k, _)| k == other)
                .map(|(_, v)| v.as_str()),
        }
    }
}

type KeyFn = Arc<dyn Fn(&KeyContext) -> String + Send + Sync>;

/// One of the three input shapes a `Policy` may use to derive a key: a
/// literal, a function of the caller context, or a list of named
/// selectors composed into a single canonical string.
#[derive(Clone)]
pub enum KeySpec {
    Literal(String),
    Function(KeyFn),
    Selectors(Vec<String>),
}

impl std::fmt::Debug for KeySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySpec::Literal(s) => f.debug_tuple("Literal").field(s).finish(),
            KeySpec::Function(_) => f.debug_tuple("Function").field(&"<fn>").finish(),
            KeySpec::Selectors(sels) => f.debug_tuple("Selectors").field(sels).finish(),
        }
    }
}

impl KeySpec {
    pub fn literal(s: impl Into<String>) -> Self {
        KeySpec::Literal(s.into())
    }

    pub fn function(f: impl Fn(&KeyContext) -> String + Send + Sync + 'static) -> Self {
        KeySpec::Function(Arc::new(f))
    }

    pub fn selectors<I, S>(sels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KeySpec::Selectors(sels.into_iter().map(Into::into).collect())
    }

    /// Compose the configured shape into a single canonical string. Two
    /// different shapes that produce the same canonical bytes MUST yield
    /// equal keys — selectors are always joined in the *given* order with
    /// a fixed separator, never sorted or deduplicated, so the caller
    /// controls canonical equivalence by listing selectors in a consistent
    /// order.
    pub fn canonicalize(&self, ctx: &KeyContext) -> Result<String> {
        match self {
            KeySpec::Literal(s) => Ok(s.clone()),
            KeySpec::Function(f) => Ok(f(ctx)),
            KeySpec::Selectors(sels) => {
                if sels.is_empty() {
                    return Err(RateLimitError::BadConfig(
                        "key selector list must not be empty".into(),
                    ));
                }
                let mut parts = Vec::with_capacity(sels.len());
                for sel in sels {
                    let value = ctx.get(sel).ok_or_else(|| {
                        RateLimitError::BadConfig(format!("unknown key selector: {sel:?}"))
                    })?;
                    parts.push(value.to_string());
                }
                Ok(parts.join("\u{1f}"))
            }
        }
    }
}

/// Fingerprint a canonical string down to a bounded, printable,
/// collision-resistant form. Strings at or under the threshold pass
/// through unchanged (cheap, human-readable in logs); longer ones
/// collapse to a hex-SHA256 digest with a `"h:"` tag so the two encodings
/// can never collide with each other.
pub fn fingerprint(raw: &str) -> String {
    if raw.len() <= MAX_FINGERPRINT_BYTES {
        return raw.to_string();
    }
    let digest = Sha256::digest(raw.as_bytes());
    format!("h:{}", hex::encode(digest))
}

/// Build the full backend storage key: `"<prefix>:<algo-tag>:<fingerprint>"`.
pub fn storage_key(prefix: &str, algo_tag: &str, raw_key: &str) -> String {
    format!("{prefix}:{algo_tag}:{}", fingerprint(raw_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_passes_through() {
        let ctx = KeyContext::default();
        let spec = KeySpec::literal("fixed-key");
        assert_eq!(spec.canonicalize(&ctx).unwrap(), "fixed-key");
    }

    #[test]
    fn function_receives_context() {
        let spec = KeySpec::function(|ctx| {
            format!("{}:{}", ctx.client_address.clone().unwrap_or_default(), 1)
        });
        let ctx = KeyContext {
            client_address: Some("10.0.0.1".into()),
            ..Default::default()
        };
        assert_eq!(spec.canonicalize(&ctx).unwrap(), "10.0.0.1:1");
    }

    #[test]
    fn selectors_compose_in_order() {
        let spec = KeySpec::selectors(["client-address", "path"]);
        let ctx = KeyContext {
            client_address: Some("10.0.0.1".into()),
            path: Some("/v1/users".into()),
            ..Default::default()
        };
        let canon = spec.canonicalize(&ctx).unwrap();
        assert_eq!(canon, "10.0.0.1\u{1f}/v1/users");
    }

    #[test]
    fn selectors_support_custom_names() {
        let spec = KeySpec::selectors(["tenant-id"]);
        let ctx = KeyContext {
            custom: vec![("tenant-id".into(), "acme".into())],
            ..Default::default()
        };
        assert_eq!(spec.canonicalize(&ctx).unwrap(), "acme");
    }

    #[test]
    fn unknown_selector_is_bad_config() {
        let spec = KeySpec::selectors(["nonexistent"]);
        let ctx = KeyContext::default();
        assert!(matches!(
            spec.canonicalize(&ctx),
            Err(RateLimitError::BadConfig(_))
        ));
    }

    #[test]
    fn empty_selector_list_is_bad_config() {
        let spec = KeySpec::selectors(Vec::<String>::new());
        let ctx = KeyContext::default();
        assert!(matches!(
            spec.canonicalize(&ctx),
            Err(RateLimitError::BadConfig(_))
        ));
    }

    #[test]
    fn short_fingerprint_is_identity() {
        assert_eq!(fingerprint("abc"), "abc");
    }

    #[test]
    fn long_fingerprint_hashes() {
        let raw = "x".repeat(500);
        let fp = fingerprint(&raw);
        assert!(fp.starts_with("h:"));
        assert_eq!(fp.len(), 2 + 64);
    }

    #[test]
    fn equal_canonical_bytes_yield_equal_keys_across_shapes() {
        let literal = KeySpec::literal("a\u{1f}b");
        let selectors = KeySpec::selectors(["client-address", "path"]);
        let ctx = KeyContext {
            client_address: Some("a".into()),
            path: Some("b".into()),
            ..Default::default()
        };
        assert_eq!(
            literal.canonicalize(&ctx).unwrap(),
            selectors.canonicalize(&ctx).unwrap()
        );
    }

    #[test]
    fn storage_key_shapes_prefix_algo_fingerprint() {
        let k = storage_key("rl", "fixed", "user:42");
        assert_eq!(k, "rl:fixed:user:42");
    }
}
