use serde_json::{Map, Value};

pub const DEFAULT_UPSTREAM_ASSET_HOST: &str = "images.ctfassets.net";

/// Rewrites references to the upstream asset host inside arbitrary JSON.
///
/// Replacement is a literal substring substitution on string leaves; object
/// keys are never touched. Without a public host the rewriter is the identity.
#[derive(Debug, Clone)]
pub struct AssetRewriter {
    upstream_host: String,
    public_host: Option<String>,
}

impl AssetRewriter {
    pub fn new(upstream_host: impl Into<String>, public_host: Option<String>) -> Self {
        Self {
            upstream_host: upstream_host.into(),
            public_host: public_host.filter(|h| !h.is_empty()),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.public_host.is_none() || self.upstream_host.is_empty()
    }

    pub fn rewrite(&self, value: &Value) -> Value {
        match (&self.public_host, self.upstream_host.is_empty()) {
            (Some(public), false) => rewrite_value(value, &self.upstream_host, public),
            _ => value.clone(),
        }
    }
}

/// Whether replacing `upstream_host` with `public_host` can never produce a
/// fresh occurrence of `upstream_host`, which makes `rewrite` idempotent.
///
/// Containment in either direction breaks this, and so does any overlap where
/// the tail of the public host is the head of the upstream host (or the
/// reverse), since surrounding text can complete the match.
pub fn rewrite_is_stable(upstream_host: &str, public_host: &str) -> bool {
    let (from, to) = (upstream_host.as_bytes(), public_host.as_bytes());
    if from.is_empty() || to.is_empty() {
        return true;
    }
    if public_host.contains(upstream_host) || upstream_host.contains(public_host) {
        return false;
    }
    let overlap = from.len().min(to.len());
    !(1..overlap).any(|n| to[to.len() - n..] == from[..n] || to[..n] == from[from.len() - n..])
}

fn rewrite_value(value: &Value, from: &str, to: &str) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(b) => Value::Bool(*b),
        Value::Number(n) => Value::Number(n.clone()),
        Value::String(s) if s.contains(from) => Value::String(s.replace(from, to)),
        Value::String(s) => Value::String(s.clone()),
        Value::Array(items) => Value::Array(items.iter().map(|v| rewrite_value(v, from, to)).collect()),
        Value::Object(map) => {
            let rewritten: Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), rewrite_value(v, from, to)))
                .collect();
            Value::Object(rewritten)
        }
    }
}
