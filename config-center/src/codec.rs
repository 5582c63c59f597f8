//! Flattening of namespace documents into `key -> string` maps.
//!
//! Nested mappings join their keys with `.`, sequence items are addressed as
//! `key[i]`, and null values become empty strings. An empty document
//! flattens to an empty map.

use std::collections::BTreeMap;

use crate::error::ConfigError;
use crate::keys::Format;

pub type FlatMap = BTreeMap<String, String>;

pub fn flatten(format: Format, content: &str) -> Result<FlatMap, ConfigError> {
    if content.trim().is_empty() {
        return Ok(FlatMap::new());
    }
    match format {
        Format::Yaml => flatten_yaml(content),
        Format::Json => flatten_json(content),
        Format::Props => Ok(flatten_props(content)),
    }
}

fn flatten_yaml(content: &str) -> Result<FlatMap, ConfigError> {
    let root: serde_yaml::Value = serde_yaml::from_str(content)
        .map_err(|err| ConfigError::Invalid(format!("yaml content: {err}")))?;
    let mut out = FlatMap::new();
    match root {
        serde_yaml::Value::Null => {}
        serde_yaml::Value::Mapping(_) => walk_yaml("", &root, &mut out),
        _ => return Err(ConfigError::Invalid("yaml content must be a mapping".into())),
    }
    Ok(out)
}

fn yaml_key(key: &serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

fn walk_yaml(path: &str, value: &serde_yaml::Value, out: &mut FlatMap) {
    use serde_yaml::Value;

    match value {
        Value::Mapping(map) => {
            for (key, child) in map {
                walk_yaml(&join(path, &yaml_key(key)), child, out);
            }
        }
        Value::Sequence(items) => {
            for (i, child) in items.iter().enumerate() {
                walk_yaml(&format!("{path}[{i}]"), child, out);
            }
        }
        Value::Tagged(tagged) => walk_yaml(path, &tagged.value, out),
        Value::Null => {
            out.insert(path.to_string(), String::new());
        }
        Value::Bool(b) => {
            out.insert(path.to_string(), b.to_string());
        }
        Value::Number(n) => {
            out.insert(path.to_string(), n.to_string());
        }
        Value::String(s) => {
            out.insert(path.to_string(), s.clone());
        }
    }
}

fn flatten_json(content: &str) -> Result<FlatMap, ConfigError> {
    let root: serde_json::Value = serde_json::from_str(content)
        .map_err(|err| ConfigError::Invalid(format!("json content: {err}")))?;
    let mut out = FlatMap::new();
    match root {
        serde_json::Value::Null => {}
        serde_json::Value::Object(_) => walk_json("", &root, &mut out),
        _ => return Err(ConfigError::Invalid("json content must be an object".into())),
    }
    Ok(out)
}

fn walk_json(path: &str, value: &serde_json::Value, out: &mut FlatMap) {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            for (key, child) in map {
                walk_json(&join(path, key), child, out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                walk_json(&format!("{path}[{i}]"), child, out);
            }
        }
        Value::Null => {
            out.insert(path.to_string(), String::new());
        }
        Value::String(s) => {
            out.insert(path.to_string(), s.clone());
        }
        other => {
            out.insert(path.to_string(), other.to_string());
        }
    }
}

/// `key=value` or `key: value` per line; `#` and `!` start comments.
fn flatten_props(content: &str) -> FlatMap {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
        .filter_map(|line| {
            let (key, value) = match line.find(['=', ':']) {
                Some(at) => (&line[..at], &line[at + 1..]),
                None => (line, ""),
            };
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}
