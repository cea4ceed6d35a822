//! Recursive document merging.
//!
//! This is the single place that implements the overlay merge contract used
//! everywhere a partial document is layered on top of a base document: chain
//! templates, genesis overlays, node/app config patches and the relayer
//! overlay all go through here.
//!
//! Conflict rules:
//! - mapping vs mapping: merged key by key, recursively
//! - scalar (or mismatched kinds): the overlay value wins
//! - sequences: the overlay replaces the base, unless the overlay key is
//!   spelled with a trailing `+` (e.g. `accounts+:`), in which case the
//!   overlay sequence is appended to the base sequence

use serde_yaml::Value as Yaml;
use serde_json::Value as Json;

/// Merge `overlay` on top of `base` for YAML documents.
pub fn merge_yaml(base: Yaml, overlay: Yaml) -> Yaml {
    match (base, overlay) {
        (Yaml::Mapping(mut merged), Yaml::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                let (target, append) = split_append_key_yaml(key);
                let entry = match merged.remove(&target) {
                    Some(existing) if append => append_yaml(existing, value),
                    Some(existing) => merge_yaml(existing, value),
                    None => value,
                };
                merged.insert(target, entry);
            }
            Yaml::Mapping(merged)
        }
        (_, overlay) => overlay,
    }
}

fn split_append_key_yaml(key: Yaml) -> (Yaml, bool) {
    let stripped = key
        .as_str()
        .and_then(|s| s.strip_suffix('+'))
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    match stripped {
        Some(target) => (Yaml::String(target), true),
        None => (key, false),
    }
}

fn append_yaml(base: Yaml, overlay: Yaml) -> Yaml {
    match (base, overlay) {
        (Yaml::Sequence(mut items), Yaml::Sequence(tail)) => {
            items.extend(tail);
            Yaml::Sequence(items)
        }
        (base, overlay) => merge_yaml(base, overlay),
    }
}

/// Merge `overlay` on top of `base` for JSON documents (genesis, relayer).
pub fn merge_json(base: Json, overlay: Json) -> Json {
    match (base, overlay) {
        (Json::Object(mut merged), Json::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let stripped = key
                    .strip_suffix('+')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
                let (target, append) = match stripped {
                    Some(target) => (target, true),
                    None => (key, false),
                };
                let entry = match merged.remove(&target) {
                    Some(existing) if append => append_json(existing, value),
                    Some(existing) => merge_json(existing, value),
                    None => value,
                };
                merged.insert(target, entry);
            }
            Json::Object(merged)
        }
        (_, overlay) => overlay,
    }
}

fn append_json(base: Json, overlay: Json) -> Json {
    match (base, overlay) {
        (Json::Array(mut items), Json::Array(tail)) => {
            items.extend(tail);
            Json::Array(items)
        }
        (base, overlay) => merge_json(base, overlay),
    }
}

/// Convert an expanded YAML value into JSON, e.g. for genesis overlays.
///
/// Fails on structures JSON cannot represent (non-string mapping keys).
pub fn yaml_to_json(value: &Yaml) -> Result<Json, serde_json::Error> {
    serde_json::to_value(value)
}
