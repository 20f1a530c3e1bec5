use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::descriptor::{ArgValue, BoundArgs, ToolDescriptor};

/// Deterministic digest identifying a semantically equivalent request.
/// Two requests with equal fingerprints are interchangeable for
/// caching purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading hex used for log lines and the on-disk shard prefix.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }

    pub fn from_hex(hex: impl Into<String>) -> Self {
        Fingerprint(hex.into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Digest material for a canonicalised request. Arguments arrive
/// sorted by name (BoundArgs is a BTreeMap), paths lexically
/// normalised and enum values lower-cased by binding. Correlation ids,
/// timeouts and cache policy are deliberately excluded; a stdin
/// payload is included because it changes the observable outcome.
///
/// Every field is length-prefixed. String values are caller
/// controlled, so a separator-based encoding would let a value
/// containing `\n` and `=` forge another request's material.
pub fn canonical_material(
    descriptor: &ToolDescriptor,
    args: &BoundArgs,
    stdin: Option<&[u8]>,
) -> String {
    let mut material = String::new();
    push_field(&mut material, "tool", &descriptor.name);
    push_field(&mut material, "version", &descriptor.version);
    for (name, value) in args {
        let rendered = match value {
            ArgValue::Flag(b) => b.to_string(),
            ArgValue::Integer(n) => n.to_string(),
            ArgValue::String(s) => s.clone(),
        };
        push_field(&mut material, name, &rendered);
    }
    if let Some(payload) = stdin {
        push_field(&mut material, "stdin", &hex_digest(payload));
    }
    material
}

fn push_field(material: &mut String, name: &str, value: &str) {
    material.push_str(&name.len().to_string());
    material.push(':');
    material.push_str(name);
    material.push('=');
    material.push_str(&value.len().to_string());
    material.push(':');
    material.push_str(value);
    material.push('\n');
}

pub fn fingerprint(
    descriptor: &ToolDescriptor,
    args: &BoundArgs,
    stdin: Option<&[u8]>,
) -> Fingerprint {
    let material = canonical_material(descriptor, args, stdin);
    Fingerprint(hex_digest(material.as_bytes()))
}

fn hex_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::collections::HashMap;
    use std::path::PathBuf;

    use super::*;
    use crate::descriptor::{ArgKind, ArgSpec};

    fn descriptor() -> ToolDescriptor {
        ToolDescriptor {
            name: "nmap".into(),
            program: PathBuf::from("/usr/bin/nmap"),
            version: "7.94".into(),
            args: vec![
                ArgSpec {
                    name: "target".into(),
                    kind: ArgKind::String,
                    required: true,
                    values: vec![],
                },
                ArgSpec {
                    name: "ports".into(),
                    kind: ArgKind::String,
                    required: false,
                    values: vec![],
                },
            ],
            default_timeout_ms: 60_000,
            class: "network-heavy".into(),
            env: HashMap::new(),
            working_dir: None,
        }
    }

    fn bind(pairs: &[(&str, &str)]) -> BoundArgs {
        let desc = descriptor();
        let mut raw = BTreeMap::new();
        for (k, v) in pairs {
            raw.insert((*k).to_string(), ArgValue::String((*v).to_string()));
        }
        desc.bind_args(&raw, None).expect("bind")
    }

    #[test]
    fn fingerprint_is_insensitive_to_argument_order() {
        let desc = descriptor();
        let a = bind(&[("target", "10.0.0.1"), ("ports", "80,443")]);
        let b = bind(&[("ports", "80,443"), ("target", "10.0.0.1")]);
        assert_eq!(fingerprint(&desc, &a, None), fingerprint(&desc, &b, None));
    }

    #[test]
    fn fingerprint_changes_with_values_and_version() {
        let desc = descriptor();
        let a = bind(&[("target", "10.0.0.1")]);
        let b = bind(&[("target", "10.0.0.2")]);
        assert_ne!(fingerprint(&desc, &a, None), fingerprint(&desc, &b, None));

        let mut upgraded = descriptor();
        upgraded.version = "7.95".into();
        assert_ne!(
            fingerprint(&desc, &a, None),
            fingerprint(&upgraded, &a, None)
        );
    }

    #[test]
    fn separator_bearing_values_cannot_forge_other_arguments() {
        let desc = descriptor();
        let forged = bind(&[("target", "1\n5:ports=1:2")]);
        let honest = bind(&[("target", "1"), ("ports", "2")]);
        assert_ne!(
            canonical_material(&desc, &forged, None),
            canonical_material(&desc, &honest, None)
        );
        assert_ne!(
            fingerprint(&desc, &forged, None),
            fingerprint(&desc, &honest, None)
        );

        // the plain newline-and-equals forgery must not collide either
        let forged = bind(&[("target", "1\nports=2")]);
        assert_ne!(
            fingerprint(&desc, &forged, None),
            fingerprint(&desc, &honest, None)
        );
    }

    #[test]
    fn stdin_payload_is_digest_material() {
        let desc = descriptor();
        let args = bind(&[("target", "10.0.0.1")]);
        assert_ne!(
            fingerprint(&desc, &args, None),
            fingerprint(&desc, &args, Some(b"wordlist"))
        );
    }

    #[test]
    fn canonicalisation_is_idempotent() {
        let desc = descriptor();
        let mut raw = BTreeMap::new();
        raw.insert("target".into(), ArgValue::String("10.0.0.1".into()));
        let once = desc.bind_args(&raw, None).expect("bind");
        let twice = desc.bind_args(&once, None).expect("rebind");
        assert_eq!(once, twice);
        assert_eq!(
            canonical_material(&desc, &once, None),
            canonical_material(&desc, &twice, None)
        );
    }
}
