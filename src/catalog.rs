//! Component catalog built from the editor config sent with each request.
//!
//! The agent reads it through two tools before it mutates anything, and the
//! normalizer reads field options (`size`) and default props from it.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NameResolution {
    pub names: Vec<String>,
    pub missing: Vec<String>,
}

/// Split a comma-separated query and resolve each token case-insensitively
/// against `lookup` (lower-cased name -> canonical name).
///
/// Tokens and resolved names are both de-duplicated, first occurrence wins.
/// There is no matching beyond case folding.
pub fn resolve_names(query: &str, lookup: &HashMap<String, String>) -> NameResolution {
    let mut resolution = NameResolution::default();
    let mut seen_tokens = HashSet::new();
    let mut seen_names = HashSet::new();

    for token in query.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let key = token.to_lowercase();
        if !seen_tokens.insert(key.clone()) {
            continue;
        }
        match lookup.get(&key) {
            Some(name) => {
                if seen_names.insert(name.clone()) {
                    resolution.names.push(name.clone());
                }
            }
            None => resolution.missing.push(token.to_string()),
        }
    }

    resolution
}

#[derive(Debug, Clone, Default)]
pub struct ComponentCatalog {
    components: BTreeMap<String, Value>,
    lookup: HashMap<String, String>,
}

impl ComponentCatalog {
    /// Reads `config.components`; a missing or malformed config gives an empty catalog.
    pub fn from_config(config: Option<&Value>) -> Self {
        let components: BTreeMap<String, Value> = config
            .and_then(|c| c.get("components"))
            .and_then(Value::as_object)
            .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        let lookup = components
            .keys()
            .map(|name| (name.to_lowercase(), name.clone()))
            .collect();

        Self { components, lookup }
    }

    pub fn resolve_names(&self, query: &str) -> NameResolution {
        resolve_names(query, &self.lookup)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn definition(&self, name: &str) -> Option<&Value> {
        self.components.get(name)
    }

    pub fn default_props(&self, name: &str) -> Option<&serde_json::Map<String, Value>> {
        self.components
            .get(name)
            .and_then(|c| c.get("defaultProps"))
            .and_then(Value::as_object)
    }

    /// Declared option values of a component field, in declaration order.
    ///
    /// Options may be plain strings or `{label, value}` objects.
    pub fn field_options(&self, name: &str, field: &str) -> Vec<String> {
        self.components
            .get(name)
            .and_then(|c| c.get("fields"))
            .and_then(|f| f.get(field))
            .and_then(|f| f.get("options"))
            .and_then(Value::as_array)
            .map(|options| {
                options
                    .iter()
                    .filter_map(|option| match option {
                        Value::String(s) => Some(s.clone()),
                        Value::Object(obj) => obj.get("value").and_then(|v| match v {
                            Value::String(s) => Some(s.clone()),
                            Value::Number(n) => Some(n.to_string()),
                            _ => None,
                        }),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Payload of the `getComponentDefinitions` tool.
    pub fn definitions_for(&self, query: &str) -> Value {
        let resolution = self.resolve_names(query);
        let definitions: serde_json::Map<String, Value> = resolution
            .names
            .iter()
            .filter_map(|name| {
                self.definition(name)
                    .map(|def| (name.clone(), def.clone()))
            })
            .collect();

        json!({
            "definitions": definitions,
            "found": resolution.names,
            "missing": resolution.missing,
        })
    }

    /// Payload of the `getSectionExamples` tool.
    pub fn section_examples_for(&self, query: &str) -> Value {
        let resolution = self.resolve_names(query);
        let examples: serde_json::Map<String, Value> = resolution
            .names
            .iter()
            .map(|name| {
                let default_props = self.default_props(name).cloned();
                let example = json!({
                    "hasDefaultProps": default_props.as_ref().is_some_and(|p| !p.is_empty()),
                    "defaultProps": default_props.unwrap_or_default(),
                    "summary": self.summary(name),
                });
                (name.clone(), example)
            })
            .collect();

        json!({
            "examples": examples,
            "found": resolution.names,
            "missing": resolution.missing,
        })
    }

    /// One-line description of a component: its fields and which ones have defaults.
    pub fn summary(&self, name: &str) -> String {
        let fields: Vec<&str> = self
            .components
            .get(name)
            .and_then(|c| c.get("fields"))
            .and_then(Value::as_object)
            .map(|f| f.keys().map(String::as_str).collect())
            .unwrap_or_default();
        let defaults: Vec<&str> = self
            .default_props(name)
            .map(|p| p.keys().map(String::as_str).collect())
            .unwrap_or_default();

        let mut summary = name.to_string();
        if fields.is_empty() {
            summary.push_str(" (no fields)");
        } else {
            summary.push_str(&format!(" fields: {}", fields.join(", ")));
        }
        if !defaults.is_empty() {
            summary.push_str(&format!("; defaults: {}", defaults.join(", ")));
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ComponentCatalog {
        ComponentCatalog::from_config(Some(&json!({
            "components": {
                "Button": {
                    "fields": {"label": {"type": "text"}, "size": {"type": "select", "options": [
                        {"label": "Small", "value": "sm"}, {"label": "Medium", "value": "md"}, "lg"
                    ]}},
                    "defaultProps": {"label": "Click", "size": "sm"}
                },
                "Heading": {"fields": {"title": {"type": "text"}}},
                "Spacer": {}
            }
        })))
    }

    #[test]
    fn resolves_names_case_insensitively() {
        let resolution = catalog().resolve_names("button, HEADING");
        assert_eq!(resolution.names, vec!["Button", "Heading"]);
        assert!(resolution.missing.is_empty());
    }

    #[test]
    fn dedupes_tokens_and_reports_missing() {
        let resolution = catalog().resolve_names(" Heading ,heading,,Carousel, carousel , button");
        assert_eq!(resolution.names, vec!["Heading", "Button"]);
        assert_eq!(resolution.missing, vec!["Carousel"]);
    }

    #[test]
    fn reads_option_values_in_order() {
        assert_eq!(catalog().field_options("Button", "size"), vec!["sm", "md", "lg"]);
        assert!(catalog().field_options("Heading", "size").is_empty());
        assert!(catalog().field_options("Nope", "size").is_empty());
    }

    #[test]
    fn definitions_payload_lists_found_and_missing() {
        let payload = catalog().definitions_for("heading, Hero");
        assert_eq!(payload["found"], json!(["Heading"]));
        assert_eq!(payload["missing"], json!(["Hero"]));
        assert!(payload["definitions"]["Heading"]["fields"]["title"].is_object());
    }

    #[test]
    fn section_examples_carry_defaults_and_summary() {
        let payload = catalog().section_examples_for("button,spacer");
        assert_eq!(payload["examples"]["Button"]["hasDefaultProps"], true);
        assert_eq!(payload["examples"]["Button"]["defaultProps"]["label"], "Click");
        assert_eq!(payload["examples"]["Spacer"]["hasDefaultProps"], false);
        assert_eq!(payload["examples"]["Spacer"]["summary"], "Spacer (no fields)");
        assert_eq!(
            payload["examples"]["Button"]["summary"],
            "Button fields: label, size; defaults: label, size"
        );
    }

    #[test]
    fn missing_config_gives_empty_catalog() {
        let catalog = ComponentCatalog::from_config(None);
        assert!(catalog.is_empty());
        let resolution = catalog.resolve_names("Button");
        assert_eq!(resolution.missing, vec!["Button"]);
    }
}
