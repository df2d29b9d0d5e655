use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};

/// Errors on the startup/configuration path. Everything here fails fast.
#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, String),
    /// A merge tried to replace a map with a scalar (or the reverse).
    Shape {
        key: String,
        old: String,
        new: String,
    },
    InvalidOverride(String),
    InvalidPattern {
        pattern: String,
        reason: String,
    },
    InvalidGraceTime {
        key: String,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "cannot read {}: {e}", path.display()),
            ConfigError::Parse(path, e) => write!(f, "cannot parse {}: {e}", path.display()),
            ConfigError::Shape { key, old, new } => write!(
                f,
                "incoherent values for key {key}: cannot replace {old} with {new}"
            ),
            ConfigError::InvalidOverride(raw) => {
                write!(f, "invalid override {raw:?}, expected KEY=VALUE")
            }
            ConfigError::InvalidPattern { pattern, reason } => {
                write!(f, "invalid image pattern {pattern:?}: {reason}")
            }
            ConfigError::InvalidGraceTime { key, reason } => {
                write!(f, "invalid grace time under {key}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// The merged configuration tree: file content (if any) with `-c KEY=VAL`
/// overrides applied on top. Consumers address values by dotted path.
#[derive(Debug)]
pub struct Config {
    root: Value,
}

impl Config {
    /// Load the configuration file (explicit path, or `~/.caduc/config.yml`
    /// when it exists) and apply the inline overrides over it.
    pub fn load(overrides: &[String], path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut root = match resolve_path(path) {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| ConfigError::Io(path.clone(), e))?;
                let value: Value = if text.trim().is_empty() {
                    Value::Null
                } else {
                    serde_yaml::from_str(&text)
                        .map_err(|e| ConfigError::Parse(path.clone(), e.to_string()))?
                };
                match value {
                    Value::Null => Value::Mapping(Mapping::new()),
                    Value::Mapping(m) => Value::Mapping(m),
                    other => {
                        return Err(ConfigError::Parse(
                            path,
                            format!("expected a mapping at the top level, got {}", kind_of(&other)),
                        ))
                    }
                }
            }
            None => Value::Mapping(Mapping::new()),
        };

        for raw in overrides {
            let (key, text) = raw
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidOverride(raw.clone()))?;
            if key.is_empty() {
                return Err(ConfigError::InvalidOverride(raw.clone()));
            }
            let value: Value =
                serde_yaml::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()));
            merge(&mut root, nest(key, value), key)?;
        }

        Ok(Self { root })
    }

    /// Look up a value by dotted path. Returns `None` when any segment is
    /// missing or a non-map value is traversed.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut node = &self.root;
        for key in path.split('.') {
            node = node.as_mapping()?.get(key)?;
        }
        Some(node)
    }

    #[cfg(test)]
    pub fn from_yaml(text: &str) -> Self {
        let root: Value = serde_yaml::from_str(text).expect("valid test yaml");
        Self { root }
    }

    #[cfg(test)]
    pub fn empty() -> Self {
        Self {
            root: Value::Mapping(Mapping::new()),
        }
    }
}

fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let default = dirs::home_dir()?.join(".caduc").join("config.yml");
    default.exists().then_some(default)
}

/// Wrap a value into nested single-key mappings following a dotted key.
fn nest(key: &str, value: Value) -> Value {
    let mut node = value;
    for part in key.rsplit('.') {
        let mut map = Mapping::new();
        map.insert(Value::String(part.to_string()), node);
        node = Value::Mapping(map);
    }
    node
}

/// Recursive merge: maps merge per key, anything else overrides. Replacing a
/// map with a scalar (or a scalar with a map) is a configuration mistake and
/// fails loudly.
fn merge(dst: &mut Value, src: Value, key_path: &str) -> Result<(), ConfigError> {
    match (dst, src) {
        (Value::Mapping(dst_map), Value::Mapping(src_map)) => {
            for (key, src_val) in src_map {
                let key_str = key.as_str().unwrap_or("?").to_string();
                let child_path = if key_path.is_empty() {
                    key_str
                } else {
                    format!("{key_path}.{key_str}")
                };
                match dst_map.get_mut(&key) {
                    Some(dst_val) => merge(dst_val, src_val, &child_path)?,
                    None => {
                        dst_map.insert(key, src_val);
                    }
                }
            }
            Ok(())
        }
        (dst @ Value::Null, src) => {
            *dst = src;
            Ok(())
        }
        (Value::Mapping(_), src) => Err(ConfigError::Shape {
            key: key_path.to_string(),
            old: "a map".into(),
            new: kind_of(&src).into(),
        }),
        (dst, src @ Value::Mapping(_)) => Err(ConfigError::Shape {
            key: key_path.to_string(),
            old: kind_of(dst).into(),
            new: kind_of(&src).into(),
        }),
        (dst, src) => {
            *dst = src;
            Ok(())
        }
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a map",
        Value::Tagged(_) => "a tagged value",
    }
}
