//! Declarative Skill Descriptor
//!
//! Reads `skill.yaml`, a deliberately tiny subset of YAML: flat `key: value`
//! pairs and `- item` lists under a key with an empty value. Comments start
//! with `#`. Anything else is ignored rather than interpreted.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;

/// Descriptor file name
pub const DESCRIPTOR_FILE: &str = "skill.yaml";

static KEY_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z0-9_\-]+)\s*:\s*(.*)$").unwrap());

/// A parsed descriptor value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorValue {
    Scalar(String),
    List(Vec<String>),
}

/// Fields taken from `skill.yaml`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    pub permissions: Vec<String>,
    /// Canned reply of the synthesized entrypoint
    pub message: String,
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    let stripped = s
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .or_else(|| s.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')));
    stripped.unwrap_or(s).to_string()
}

/// Parse the flat key/value subset
pub fn parse_flat(text: &str) -> HashMap<String, DescriptorValue> {
    let mut out = HashMap::new();
    let mut current: Option<String> = None;

    for raw in text.lines() {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if let Some(item) = trimmed.strip_prefix('-') {
            let Some(key) = current.as_ref() else { continue };
            let item = unquote(item);
            let entry = out
                .entry(key.clone())
                .or_insert_with(|| DescriptorValue::List(Vec::new()));
            if let DescriptorValue::Scalar(_) = *entry {
                *entry = DescriptorValue::List(Vec::new());
            }
            if let DescriptorValue::List(items) = entry {
                if !item.is_empty() {
                    items.push(item);
                }
            }
            continue;
        }

        if let Some(caps) = KEY_LINE.captures(raw) {
            let key = caps[1].to_string();
            let value = caps[2].trim();
            let parsed = if value.is_empty() {
                DescriptorValue::List(Vec::new())
            } else {
                DescriptorValue::Scalar(unquote(value))
            };
            out.insert(key.clone(), parsed);
            current = Some(key);
        }
    }

    out
}

/// Lowercase slug made of `[a-z0-9_-]`, `user_skill` when nothing is left
pub fn slugify(s: &str) -> String {
    static DISALLOWED: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9_\- ]+").unwrap());
    static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
    static UNDERSCORES: Lazy<Regex> = Lazy::new(|| Regex::new(r"_+").unwrap());

    let s = s.trim().to_lowercase();
    let s = DISALLOWED.replace_all(&s, "");
    let s = SPACES.replace_all(&s, "_");
    let s = UNDERSCORES.replace_all(&s, "_");
    let s = s.trim_matches(|c| c == '_' || c == '-');
    if s.is_empty() {
        "user_skill".to_string()
    } else {
        s.to_string()
    }
}

fn scalar(map: &HashMap<String, DescriptorValue>, key: &str) -> Option<String> {
    match map.get(key) {
        Some(DescriptorValue::Scalar(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

impl Descriptor {
    pub fn parse(text: &str) -> Self {
        let map = parse_flat(text);
        let name = scalar(&map, "name").unwrap_or_else(|| "Skill".to_string());
        let id = slugify(&scalar(&map, "id").unwrap_or_else(|| name.clone()));
        let version = scalar(&map, "version").unwrap_or_else(|| "1.0".to_string());
        let permissions = match map.get("permissions") {
            Some(DescriptorValue::List(items)) => items.clone(),
            Some(DescriptorValue::Scalar(s)) => vec![s.clone()],
            None => Vec::new(),
        };
        let message = scalar(&map, "message")
            .or_else(|| scalar(&map, "description"))
            .unwrap_or_else(|| "OK".to_string());

        Self {
            id,
            name,
            version,
            permissions,
            message,
        }
    }

    /// Load `skill.yaml` from a skill directory, if present
    pub fn load(dir: &Path) -> std::io::Result<Option<Self>> {
        let path = dir.join(DESCRIPTOR_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)?;
        Ok(Some(Self::parse(&text)))
    }

    /// Zero-logic entry source returning the canned message
    pub fn entry_source(&self) -> String {
        let literal = serde_json::to_string(&self.message).unwrap_or_else(|_| "\"OK\"".to_string());
        format!(
            "def execute(context):\n    msg = {}\n    return {{\"success\": True, \"message\": msg}}\n",
            literal
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flat_scalars_and_lists() {
        let text = "# greeting skill\nname: \"Hello World\"\npermissions:\n  - network\n  - 'fs_read'\nmessage: hi there\n";
        let map = parse_flat(text);
        assert_eq!(map["name"], DescriptorValue::Scalar("Hello World".into()));
        assert_eq!(
            map["permissions"],
            DescriptorValue::List(vec!["network".into(), "fs_read".into()])
        );
        assert_eq!(map["message"], DescriptorValue::Scalar("hi there".into()));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Hello World!"), "hello_world");
        assert_eq!(slugify("  __Weather--  "), "weather");
        assert_eq!(slugify("¡¿!"), "user_skill");
    }

    #[test]
    fn test_descriptor_defaults() {
        let d = Descriptor::parse("description: Says hello\n");
        assert_eq!(d.name, "Skill");
        assert_eq!(d.id, "skill");
        assert_eq!(d.version, "1.0");
        assert_eq!(d.message, "Says hello");
        assert!(d.permissions.is_empty());
    }

    #[test]
    fn test_entry_source_escapes_message() {
        let d = Descriptor::parse("name: q\nmessage: say \"hi\"\n");
        let src = d.entry_source();
        assert!(src.contains(r#"msg = "say \"hi\"""#));
        assert!(src.starts_with("def execute(context):"));
    }
}
