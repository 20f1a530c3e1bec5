use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{InvokeError, InvokeResult};
use crate::paths;

/// Argument kinds a tool schema may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgKind {
    Flag,
    String,
    Integer,
    Path,
    Enum,
}

impl ArgKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArgKind::Flag => "flag",
            ArgKind::String => "string",
            ArgKind::Integer => "integer",
            ArgKind::Path => "path",
            ArgKind::Enum => "enum",
        }
    }
}

/// One named parameter in a tool's argument schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    pub kind: ArgKind,
    #[serde(default)]
    pub required: bool,
    /// Allowed values, `enum` kind only.
    #[serde(default)]
    pub values: Vec<String>,
}

/// A bound argument value. Tagged variants, no dynamic typing past the
/// dispatcher boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Flag(bool),
    Integer(i64),
    String(String),
}

impl ArgValue {
    fn kind_name(&self) -> &'static str {
        match self {
            ArgValue::Flag(_) => "flag",
            ArgValue::Integer(_) => "integer",
            ArgValue::String(_) => "string",
        }
    }
}

/// Arguments validated against a descriptor schema, keyed by name.
/// BTreeMap keeps them in canonical (sorted) order.
pub type BoundArgs = BTreeMap<String, ArgValue>;

/// Immutable registration of an invokable external tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    #[serde(skip, default)]
    pub name: String,
    pub program: PathBuf,
    /// Version token mixed into fingerprints; bump to invalidate
    /// cached outcomes after a tool upgrade.
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "arg")]
    pub args: Vec<ArgSpec>,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Parallelism class tag, e.g. `network-heavy`, `cpu-heavy`,
    /// `browser`. Tools in one class share a concurrency budget.
    #[serde(default = "default_class")]
    pub class: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_class() -> String {
    "default".to_string()
}

impl ToolDescriptor {
    /// Schema sanity check, applied once at registration.
    pub fn validate(&self) -> InvokeResult<()> {
        if self.program.as_os_str().is_empty() {
            return Err(InvokeError::BadRequest(format!(
                "tool '{}': empty program path",
                self.name
            )));
        }
        if self.default_timeout_ms == 0 {
            return Err(InvokeError::BadRequest(format!(
                "tool '{}': timeout must be greater than zero",
                self.name
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for spec in &self.args {
            if !seen.insert(spec.name.as_str()) {
                return Err(InvokeError::BadRequest(format!(
                    "tool '{}': duplicate argument '{}'",
                    self.name, spec.name
                )));
            }
            match spec.kind {
                ArgKind::Enum if spec.values.is_empty() => {
                    return Err(InvokeError::BadRequest(format!(
                        "tool '{}': enum argument '{}' declares no values",
                        self.name, spec.name
                    )));
                }
                _ if spec.kind != ArgKind::Enum && !spec.values.is_empty() => {
                    return Err(InvokeError::BadRequest(format!(
                        "tool '{}': argument '{}' lists values but is not an enum",
                        self.name, spec.name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Bind raw argument values against the schema. Unknown names,
    /// missing required arguments and kind mismatches are
    /// `bad-request`; a path escaping `workspace_root` is `forbidden`.
    pub fn bind_args(
        &self,
        raw: &BTreeMap<String, ArgValue>,
        workspace_root: Option<&Path>,
    ) -> InvokeResult<BoundArgs> {
        for name in raw.keys() {
            if !self.args.iter().any(|spec| &spec.name == name) {
                return Err(InvokeError::BadRequest(format!(
                    "unknown argument '{}' for tool '{}'",
                    name, self.name
                )));
            }
        }

        let mut bound = BTreeMap::new();
        for spec in &self.args {
            let value = match raw.get(&spec.name) {
                Some(value) => value,
                None if spec.required => {
                    return Err(InvokeError::BadRequest(format!(
                        "missing required argument '{}'",
                        spec.name
                    )));
                }
                None => continue,
            };

            let coerced = match (spec.kind, value) {
                (ArgKind::Flag, ArgValue::Flag(b)) => ArgValue::Flag(*b),
                (ArgKind::Integer, ArgValue::Integer(n)) => ArgValue::Integer(*n),
                (ArgKind::String, ArgValue::String(s)) => ArgValue::String(s.clone()),
                (ArgKind::Enum, ArgValue::String(s)) => {
                    let lowered = s.to_lowercase();
                    if !self
                        .enum_values(&spec.name)
                        .iter()
                        .any(|allowed| allowed.eq_ignore_ascii_case(&lowered))
                    {
                        return Err(InvokeError::BadRequest(format!(
                            "argument '{}' value '{}' not in {:?}",
                            spec.name, s, spec.values
                        )));
                    }
                    ArgValue::String(lowered)
                }
                (ArgKind::Path, ArgValue::String(s)) => {
                    let candidate = Path::new(s);
                    let resolved = match workspace_root {
                        Some(root) => paths::resolve_within_root(root, candidate)
                            .map_err(|err| InvokeError::Forbidden(err.to_string()))?,
                        None => paths::normalize(candidate),
                    };
                    ArgValue::String(resolved.to_string_lossy().into_owned())
                }
                (kind, other) => {
                    return Err(InvokeError::BadRequest(format!(
                        "argument '{}' expects {}, got {}",
                        spec.name,
                        kind.as_str(),
                        other.kind_name()
                    )));
                }
            };

            bound.insert(spec.name.clone(), coerced);
        }

        Ok(bound)
    }

    fn enum_values(&self, arg: &str) -> &[String] {
        self.args
            .iter()
            .find(|spec| spec.name == arg)
            .map(|spec| spec.values.as_slice())
            .unwrap_or(&[])
    }

    /// Render bound arguments into an argv in schema order. Flags
    /// render `--name` when set; valued kinds render `--name <value>`.
    /// Tool-specific command lines are out of scope; this generic
    /// mapping is the contract.
    pub fn render_argv(&self, args: &BoundArgs) -> Vec<String> {
        let mut argv = Vec::new();
        for spec in &self.args {
            match args.get(&spec.name) {
                Some(ArgValue::Flag(true)) => argv.push(format!("--{}", spec.name)),
                Some(ArgValue::Flag(false)) | None => {}
                Some(ArgValue::Integer(n)) => {
                    argv.push(format!("--{}", spec.name));
                    argv.push(n.to_string());
                }
                Some(ArgValue::String(s)) => {
                    argv.push(format!("--{}", spec.name));
                    argv.push(s.clone());
                }
            }
        }
        argv
    }
}

/// Process-lifetime registry of tool descriptors. Immutable once built.
#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    tools: HashMap<String, Arc<ToolDescriptor>>,
}

impl DescriptorRegistry {
    pub fn new(descriptors: Vec<ToolDescriptor>) -> InvokeResult<Self> {
        let mut tools = HashMap::new();
        for descriptor in descriptors {
            descriptor.validate()?;
            let name = descriptor.name.clone();
            if tools.insert(name.clone(), Arc::new(descriptor)).is_some() {
                return Err(InvokeError::BadRequest(format!(
                    "duplicate tool registration '{}'",
                    name
                )));
            }
        }
        Ok(Self { tools })
    }

    pub fn get(&self, name: &str) -> InvokeResult<Arc<ToolDescriptor>> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| InvokeError::NoSuchTool(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
