//! YAML attribute overlay: augments search result entries with attributes
//! read from side files. Candidates are looked up per entry by DN and by
//! attribute value, so operators can key overlay data either way. Files are
//! re-read on every applicable response; edits take effect live.

use crate::filters::ResponseFilter;
use crate::ldap_protocol::{Attribute, SearchResultEntry};
use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Longest sanitized path component, in octets.
const MAX_COMPONENT_LEN: usize = 64;

pub struct YamlOverlay {
    dir: PathBuf,
    prefix: String,
}

impl YamlOverlay {
    pub fn new(dir: PathBuf, prefix: String) -> Self {
        Self { dir, prefix }
    }

    fn load_candidate(&self, candidate: &str) -> Option<Vec<(String, Vec<String>)>> {
        let path = self.dir.join(format!("{}.yaml", candidate));
        if !path.exists() {
            return None;
        }
        match read_overlay_file(&path) {
            Ok(pairs) => Some(pairs),
            Err(e) => {
                warn!("overlay file {:?} skipped: {:#}", path, e);
                None
            }
        }
    }
}

impl ResponseFilter for YamlOverlay {
    fn name(&self) -> &'static str {
        "yamloverlay"
    }

    fn apply(&mut self, entry: &mut SearchResultEntry, _message_id: i32) -> Result<()> {
        for candidate in candidate_paths(entry) {
            let Some(pairs) = self.load_candidate(&candidate) else {
                continue;
            };
            debug!("overlay {} matched entry {}", candidate, entry.object_name);
            for (attr_type, values) in pairs {
                let name = format!("{}{}", self.prefix, attr_type);
                let values: Vec<Vec<u8>> = values.into_iter().map(String::into_bytes).collect();
                // Merge into an existing attribute of the same name rather
                // than emitting a duplicate.
                match entry.attributes.iter_mut().find(|a| a.attr_type == name) {
                    Some(existing) => existing.attr_values.extend(values),
                    None => entry.attributes.push(Attribute {
                        attr_type: name,
                        attr_values: values,
                    }),
                }
            }
        }
        Ok(())
    }
}

/// Candidate overlay paths for an entry: its DN, then `type/value` for every
/// attribute value, with the value sanitized to a safe path component.
fn candidate_paths(entry: &SearchResultEntry) -> Vec<String> {
    let mut candidates = Vec::new();
    // The DN is used as-is; one containing a path separator cannot name an
    // overlay file.
    if !entry.object_name.is_empty()
        && !entry.object_name.contains('/')
        && !entry.object_name.starts_with('.')
    {
        candidates.push(entry.object_name.clone());
    }
    for attr in &entry.attributes {
        for value in &attr.attr_values {
            let sanitized = sanitize_component(&String::from_utf8_lossy(value));
            if !sanitized.is_empty() {
                candidates.push(format!("{}/{}", attr.attr_type, sanitized));
            }
        }
    }
    candidates
}

/// Collapse every run of characters outside [A-Za-z0-9_-] into a single
/// underscore and cap the result at 64 octets.
pub fn sanitize_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len().min(MAX_COMPONENT_LEN));
    let mut in_run = false;
    for c in value.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
        if out.len() >= MAX_COMPONENT_LEN {
            break;
        }
    }
    out.truncate(MAX_COMPONENT_LEN);
    out
}

/// Parse one overlay file: a mapping from attribute name to a string or a
/// sequence of strings. Scalars are wrapped in a single-element list.
fn read_overlay_file(path: &Path) -> Result<Vec<(String, Vec<String>)>> {
    let content = std::fs::read_to_string(path)?;
    let doc: serde_yaml::Value = serde_yaml::from_str(&content)?;
    let serde_yaml::Value::Mapping(map) = doc else {
        anyhow::bail!("overlay document is not a mapping");
    };
    let mut pairs = Vec::new();
    for (key, value) in map {
        let Some(attr) = key.as_str() else {
            anyhow::bail!("overlay attribute name is not a string");
        };
        let values = match value {
            serde_yaml::Value::Sequence(seq) => {
                let mut vals = Vec::with_capacity(seq.len());
                for item in seq {
                    vals.push(scalar_to_string(&item)?);
                }
                vals
            }
            other => vec![scalar_to_string(&other)?],
        };
        pairs.push((attr.to_string(), values));
    }
    Ok(pairs)
}

fn scalar_to_string(value: &serde_yaml::Value) -> Result<String> {
    match value {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        _ => anyhow::bail!("overlay value is not a scalar"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn bob_entry() -> SearchResultEntry {
        SearchResultEntry {
            object_name: "uid=bob,dc=x".to_string(),
            attributes: vec![Attribute {
                attr_type: "cn".to_string(),
                attr_values: vec![b"Bob".to_vec()],
            }],
        }
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("bob"), "bob");
        assert_eq!(sanitize_component("Bob Smith"), "Bob_Smith");
        assert_eq!(sanitize_component("a/../b"), "a_b");
        assert_eq!(sanitize_component("x!!??y"), "x_y");
        assert_eq!(sanitize_component("under_score-dash"), "under_score-dash");
        let long = "a".repeat(200);
        assert_eq!(sanitize_component(&long).len(), 64);
        // Every output must match [A-Za-z0-9_-]{1,64}.
        for input in ["日本語", "a b c", "(cn=*)", "x", "//"] {
            let s = sanitize_component(input);
            assert!(s.len() <= 64);
            assert!(s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'), "{:?}", s);
        }
    }

    #[test]
    fn test_candidate_paths() {
        let entry = bob_entry();
        let candidates = candidate_paths(&entry);
        assert_eq!(candidates, vec!["uid=bob,dc=x".to_string(), "cn/Bob".to_string()]);
    }

    #[test]
    fn test_candidate_paths_skip_traversal_dn() {
        // A DN containing a path separator cannot name an overlay file; only
        // the value-keyed candidate survives.
        let mut entry = bob_entry();
        entry.object_name = "uid=../../etc/passwd".to_string();
        assert_eq!(candidate_paths(&entry), vec!["cn/Bob".to_string()]);
    }

    #[test]
    fn test_overlay_injects_by_dn() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("uid=bob,dc=x.yaml"),
            "phone:\n  - \"555-1234\"\nrole: admin\n",
        )
        .unwrap();
        let mut overlay = YamlOverlay::new(dir.path().to_path_buf(), "my_".to_string());
        let mut entry = bob_entry();
        overlay.apply(&mut entry, 99).unwrap();

        assert_eq!(entry.attributes.len(), 3);
        let phone = entry.attributes.iter().find(|a| a.attr_type == "my_phone").unwrap();
        assert_eq!(phone.attr_values, vec![b"555-1234".to_vec()]);
        let role = entry.attributes.iter().find(|a| a.attr_type == "my_role").unwrap();
        assert_eq!(role.attr_values, vec![b"admin".to_vec()]);
    }

    #[test]
    fn test_overlay_injects_by_attribute_value() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("cn")).unwrap();
        fs::write(dir.path().join("cn/Bob.yaml"), "team: infra\n").unwrap();
        let mut overlay = YamlOverlay::new(dir.path().to_path_buf(), String::new());
        let mut entry = bob_entry();
        overlay.apply(&mut entry, 1).unwrap();
        let team = entry.attributes.iter().find(|a| a.attr_type == "team").unwrap();
        assert_eq!(team.attr_values, vec![b"infra".to_vec()]);
    }

    #[test]
    fn test_overlay_empty_dir_is_noop() {
        let dir = tempdir().unwrap();
        let mut overlay = YamlOverlay::new(dir.path().to_path_buf(), "my_".to_string());
        let mut entry = bob_entry();
        let before = entry.clone();
        overlay.apply(&mut entry, 1).unwrap();
        assert_eq!(entry, before);
    }

    #[test]
    fn test_overlay_malformed_file_skipped() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("uid=bob,dc=x.yaml"), "not: [valid").unwrap();
        let mut overlay = YamlOverlay::new(dir.path().to_path_buf(), String::new());
        let mut entry = bob_entry();
        let before = entry.clone();
        overlay.apply(&mut entry, 1).unwrap();
        assert_eq!(entry, before);
    }

    #[test]
    fn test_overlay_merges_into_existing_attribute() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("uid=bob,dc=x.yaml"), "cn: Robert\n").unwrap();
        // No prefix: injected name collides with the existing cn attribute.
        let mut overlay = YamlOverlay::new(dir.path().to_path_buf(), String::new());
        let mut entry = bob_entry();
        overlay.apply(&mut entry, 1).unwrap();
        assert_eq!(entry.attributes.len(), 1);
        assert_eq!(
            entry.attributes[0].attr_values,
            vec![b"Bob".to_vec(), b"Robert".to_vec()]
        );
    }

    #[test]
    fn test_overlay_numeric_scalar() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("uid=bob,dc=x.yaml"), "uidNumber: 1000\n").unwrap();
        let mut overlay = YamlOverlay::new(dir.path().to_path_buf(), String::new());
        let mut entry = bob_entry();
        overlay.apply(&mut entry, 1).unwrap();
        let uid = entry.attributes.iter().find(|a| a.attr_type == "uidNumber").unwrap();
        assert_eq!(uid.attr_values, vec![b"1000".to_vec()]);
    }
}
