//! Cluster spec expansion.
//!
//! Turns the raw layered YAML document into a concrete [`ClusterSpec`]:
//! resolves `${NAME}` placeholders against an override file, the process
//! environment and inline defaults; composes chains from named templates;
//! and runs the structural validation pass. Pure apart from reading the
//! override file and the environment, so expanding the same inputs twice
//! yields an identical spec.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use log::debug;
use regex::Regex;
use serde_yaml::Value;

use crate::merge::{merge_yaml, yaml_to_json};
use crate::spec::ClusterSpec;

/// Errors surfaced before any disk or process side effects.
#[derive(Debug, thiserror::Error)]
pub enum ExpansionError {
    #[error("unresolved variable `${{{name}}}`")]
    UnresolvedVariable { name: String },
    #[error("malformed cluster spec: {0}")]
    Malformed(String),
    #[error("duplicate name `{name}` in chain {chain_id}")]
    DuplicateName { chain_id: String, name: String },
    #[error("failed to read spec input")]
    Io(#[from] std::io::Error),
    #[error("failed to parse spec document")]
    Yaml(#[from] serde_yaml::Error),
}

/// Expand the spec at `config_path` into a validated [`ClusterSpec`].
///
/// `dotenv` optionally points at a POSIX `KEY=VALUE` file whose values take
/// precedence over both the file named by the spec's own `dotenv` key and
/// the process environment.
pub fn expand(config_path: &Path, dotenv: Option<&Path>) -> Result<ClusterSpec, ExpansionError> {
    let raw = std::fs::read_to_string(config_path)?;
    let mut doc: Value = serde_yaml::from_str(&raw)?;

    let mapping = doc
        .as_mapping_mut()
        .ok_or_else(|| ExpansionError::Malformed("top level must be a mapping".to_string()))?;

    // variables from the spec's dotenv reference, then the explicit override
    let parent = config_path.parent().unwrap_or_else(|| Path::new("."));
    let mut variables = BTreeMap::new();
    if let Some(named) = mapping.remove("dotenv") {
        let rel = named.as_str().ok_or_else(|| {
            ExpansionError::Malformed("`dotenv` must be a file path".to_string())
        })?;
        variables.extend(load_env_file(&parent.join(rel))?);
    }
    if let Some(path) = dotenv {
        variables.extend(load_env_file(path)?);
    }
    debug!("expanding spec with {} override variables", variables.len());

    let doc = interpolate(doc, &variables)?;
    from_document(doc)
}

/// Build a [`ClusterSpec`] from an already-interpolated document.
pub fn from_document(doc: Value) -> Result<ClusterSpec, ExpansionError> {
    let Value::Mapping(mapping) = doc else {
        return Err(ExpansionError::Malformed(
            "top level must be a mapping".to_string(),
        ));
    };

    let mut templates: BTreeMap<String, Value> = BTreeMap::new();
    let mut relayer = serde_json::Value::Null;
    let mut lifecycle = crate::lifecycle::LifecycleSettings::default();
    let mut chains = Vec::new();

    for (key, value) in mapping {
        let key = key
            .as_str()
            .ok_or_else(|| ExpansionError::Malformed("chain ids must be strings".to_string()))?
            .to_string();
        match key.as_str() {
            "templates" => {
                let Value::Mapping(entries) = value else {
                    return Err(ExpansionError::Malformed(
                        "`templates` must be a mapping".to_string(),
                    ));
                };
                for (name, template) in entries {
                    let name = name.as_str().ok_or_else(|| {
                        ExpansionError::Malformed("template names must be strings".to_string())
                    })?;
                    templates.insert(name.to_string(), template);
                }
            }
            "relayer" => {
                relayer = yaml_to_json(&value)
                    .map_err(|e| ExpansionError::Malformed(format!("relayer overlay: {e}")))?;
            }
            "lifecycle" => {
                lifecycle = serde_yaml::from_value(value)
                    .map_err(|e| ExpansionError::Malformed(format!("lifecycle settings: {e}")))?;
            }
            _ => {
                let resolved = apply_template(&key, value, &templates)?;
                let mut chain: crate::spec::ChainSpec = serde_yaml::from_value(resolved)
                    .map_err(|e| ExpansionError::Malformed(format!("chain {key}: {e}")))?;
                chain.id = key;
                chains.push(chain);
            }
        }
    }

    let spec = ClusterSpec { chains, relayer, lifecycle };
    spec.validate()?;
    Ok(spec)
}

/// Merge a chain document over the template named by its `extends` key.
///
/// Templates are declared before the chains that use them; the chain
/// document is the overlay, so its values win.
fn apply_template(
    chain_id: &str,
    value: Value,
    templates: &BTreeMap<String, Value>,
) -> Result<Value, ExpansionError> {
    let Value::Mapping(mut mapping) = value else {
        return Err(ExpansionError::Malformed(format!(
            "chain {chain_id} must be a mapping"
        )));
    };
    let Some(name) = mapping.remove("extends") else {
        return Ok(Value::Mapping(mapping));
    };
    let name = name.as_str().ok_or_else(|| {
        ExpansionError::Malformed(format!("chain {chain_id}: `extends` must be a string"))
    })?;
    let base = templates.get(name).cloned().ok_or_else(|| {
        ExpansionError::Malformed(format!(
            "chain {chain_id} extends unknown template `{name}`"
        ))
    })?;
    Ok(merge_yaml(base, Value::Mapping(mapping)))
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("placeholder pattern")
    })
}

/// Recursively resolve `${NAME}` / `${NAME:-default}` placeholders.
///
/// Priority: override-file value, process environment, inline default.
pub fn interpolate(
    value: Value,
    variables: &BTreeMap<String, String>,
) -> Result<Value, ExpansionError> {
    Ok(match value {
        Value::String(s) => Value::String(interpolate_str(&s, variables)?),
        Value::Sequence(items) => Value::Sequence(
            items
                .into_iter()
                .map(|item| interpolate(item, variables))
                .collect::<Result<_, _>>()?,
        ),
        Value::Mapping(mapping) => {
            let mut out = serde_yaml::Mapping::with_capacity(mapping.len());
            for (key, item) in mapping {
                out.insert(key, interpolate(item, variables)?);
            }
            Value::Mapping(out)
        }
        other => other,
    })
}

fn interpolate_str(
    input: &str,
    variables: &BTreeMap<String, String>,
) -> Result<String, ExpansionError> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in placeholder_regex().captures_iter(input) {
        let Some(whole) = caps.get(0) else { continue };
        let name = &caps[1];
        let resolved = variables
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
            .or_else(|| caps.get(2).map(|d| d.as_str().to_string()))
            .ok_or_else(|| ExpansionError::UnresolvedVariable { name: name.to_string() })?;
        out.push_str(&input[last..whole.start()]);
        out.push_str(&resolved);
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

/// Parse a POSIX `KEY=VALUE` file. Blank lines and `#` comments are
/// skipped, an optional `export ` prefix and surrounding quotes stripped.
fn load_env_file(path: &Path) -> Result<BTreeMap<String, String>, ExpansionError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ExpansionError::Malformed(format!("override file {}: {e}", path.display()))
    })?;
    let mut values = BTreeMap::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let (key, value) = line.split_once('=').ok_or_else(|| {
            ExpansionError::Malformed(format!(
                "override file {}:{}: expected KEY=VALUE",
                path.display(),
                lineno + 1
            ))
        })?;
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        values.insert(key.trim().to_string(), value.to_string());
    }
    Ok(values)
}
