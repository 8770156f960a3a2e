//! `filtering.rewrites` list of an AdGuard Home config.

use super::Patch;
use serde_yaml::{Mapping, Value};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("document root is not a mapping")]
    NotAMapping,
    #[error("`filtering` is not a mapping")]
    FilteringNotAMapping,
    #[error("`filtering.rewrites` is not a list")]
    RewritesNotAList,
}

/// Points every rewrite entry that has a `domain` at `ip`.
/// Untouched content is returned as-is so unchanged files are never rewritten.
pub fn patch_rewrite_list(content: &str, ip: &str) -> Result<Patch, PatchError> {
    if content.trim().is_empty() {
        return Ok(Patch::unchanged(content));
    }
    let mut doc: Value = serde_yaml::from_str(content)?;
    let root = match &mut doc {
        Value::Null => return Ok(Patch::unchanged(content)),
        Value::Mapping(m) => m,
        _ => return Err(PatchError::NotAMapping),
    };

    let filtering = root
        .entry(Value::from("filtering"))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    let Value::Mapping(filtering) = filtering else {
        return Err(PatchError::FilteringNotAMapping);
    };
    let rewrites = filtering
        .entry(Value::from("rewrites"))
        .or_insert_with(|| Value::Sequence(Vec::new()));
    let Value::Sequence(rewrites) = rewrites else {
        return Err(PatchError::RewritesNotAList);
    };

    if rewrites.is_empty() {
        info!("rewrite list is empty, nothing to point at the new IP");
        return Ok(Patch::unchanged(content));
    }

    let answer = Value::from(ip);
    let mut changed = false;
    for entry in rewrites.iter_mut() {
        let Value::Mapping(entry) = entry else { continue };
        if !entry.contains_key("domain") {
            continue;
        }
        if entry.get("answer") != Some(&answer) {
            entry.insert(Value::from("answer"), answer.clone());
            changed = true;
        }
    }

    if !changed {
        return Ok(Patch::unchanged(content));
    }
    Ok(Patch { content: serde_yaml::to_string(&doc)?, changed: true })
}
