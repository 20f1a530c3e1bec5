use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::descriptor::ArgValue;

/// What the cache may do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Serve a stored entry when one exists.
    #[default]
    Use,
    /// Ignore stored entries but still join an in-flight producer.
    Bypass,
    /// Invalidate any stored entry, then execute fresh.
    Refresh,
}

/// Per-request overrides; none of these participate in the fingerprint
/// except the stdin payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestOptions {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub cache: CachePolicy,
    /// Raw bytes piped to the tool's stdin (base64 on the wire).
    #[serde(default)]
    pub stdin: Option<String>,
}

/// The user-facing ask: a tool, bound argument values and overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub tool: String,
    #[serde(default)]
    pub args: BTreeMap<String, ArgValue>,
    #[serde(default)]
    pub options: RequestOptions,
    /// Caller-supplied, echoed in logs and scheduling tie-breaks.
    /// Never part of the fingerprint.
    #[serde(default)]
    pub correlation_id: String,
}

impl InvocationRequest {
    pub fn new(tool: impl Into<String>) -> Self {
        InvocationRequest {
            tool: tool.into(),
            args: BTreeMap::new(),
            options: RequestOptions::default(),
            correlation_id: String::new(),
        }
    }

    pub fn arg(mut self, name: impl Into<String>, value: ArgValue) -> Self {
        self.args.insert(name.into(), value);
        self
    }

    pub fn correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.options.cache = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_json_defaults() {
        let json = r#"{"tool":"echo","args":{"msg":"hi","fast":true,"count":3}}"#;
        let req: InvocationRequest = serde_json::from_str(json).expect("deserialize");
        assert_eq!(req.tool, "echo");
        assert_eq!(req.options.cache, CachePolicy::Use);
        assert_eq!(req.args.get("msg"), Some(&ArgValue::String("hi".into())));
        assert_eq!(req.args.get("fast"), Some(&ArgValue::Flag(true)));
        assert_eq!(req.args.get("count"), Some(&ArgValue::Integer(3)));
    }

    #[test]
    fn cache_policy_wire_names() {
        assert_eq!(
            serde_json::to_string(&CachePolicy::Refresh).expect("serialize"),
            "\"refresh\""
        );
        let policy: CachePolicy = serde_json::from_str("\"bypass\"").expect("deserialize");
        assert_eq!(policy, CachePolicy::Bypass);
    }
}
