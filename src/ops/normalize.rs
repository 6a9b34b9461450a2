//! Normalization of model-proposed operations against the current document.
//!
//! Models are imprecise about ids and tend to echo props that did not change.
//! Before an `update` is emitted it is checked against the snapshot: the id is
//! repaired or the op dropped, "make it bigger" requests are resolved to the
//! next declared size, and props equal to the current value are removed.

use std::sync::OnceLock;

use regex_lite::Regex;
use serde_json::Value;

use super::{BuildOperation, DocumentIndex, PageComponent, Props};
use crate::catalog::ComponentCatalog;

/// Keys that are always forwarded, even when unchanged.
const CLASS_NAME_KEYS: [&str; 2] = ["class", "className"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Repair {
    /// The strategy does not recognise this id.
    NotApplicable,
    Resolved(String),
    /// The strategy recognised the id but found no target; the op is dropped.
    Unresolved,
}

/// Recovers the target of an `update` whose id is not in the document.
pub trait IdRepair: Send + Sync {
    fn repair(&self, id: &str, document: &DocumentIndex) -> Repair;
}

/// Models regularly invent ids like `team-heading` for the heading of a team
/// section. Map those to the `Heading` whose title mentions "team".
pub struct TeamHeadingRepair;

impl IdRepair for TeamHeadingRepair {
    fn repair(&self, id: &str, document: &DocumentIndex) -> Repair {
        if !id.to_lowercase().contains("team") {
            return Repair::NotApplicable;
        }
        document
            .components()
            .find(|c| {
                c.component_type == "Heading"
                    && c.props
                        .get("title")
                        .and_then(Value::as_str)
                        .is_some_and(|title| title.to_lowercase().contains("team"))
            })
            .map(|c| Repair::Resolved(c.id.clone()))
            .unwrap_or(Repair::Unresolved)
    }
}

pub fn default_repairs() -> Vec<Box<dyn IdRepair>> {
    vec![Box::new(TeamHeadingRepair)]
}

fn increase_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"\b(bigger|larger|increase|enlarge|grow|größer|groesser|vergrößer|vergroesser|erhöh|erhoeh)",
            )
            .ok()
        })
        .as_ref()
}

/// Does the request ask for something to get bigger (English or German)?
pub fn has_increase_intent(description: &str) -> bool {
    increase_pattern().is_some_and(|re| re.is_match(&description.to_lowercase()))
}

pub struct Normalizer<'a> {
    document: &'a DocumentIndex,
    catalog: &'a ComponentCatalog,
    repairs: Vec<Box<dyn IdRepair>>,
}

impl<'a> Normalizer<'a> {
    pub fn new(document: &'a DocumentIndex, catalog: &'a ComponentCatalog) -> Self {
        Self {
            document,
            catalog,
            repairs: default_repairs(),
        }
    }

    pub fn with_repairs(mut self, repairs: Vec<Box<dyn IdRepair>>) -> Self {
        self.repairs = repairs;
        self
    }

    /// Normalize a batch. Only `update` ops are touched; the others pass through.
    pub fn normalize(&self, batch: &[BuildOperation], description: &str) -> Vec<BuildOperation> {
        let increase = has_increase_intent(description);
        batch
            .iter()
            .filter_map(|op| match op {
                BuildOperation::Update { id, props } => self.normalize_update(id, props, increase),
                other => Some(other.clone()),
            })
            .collect()
    }

    fn normalize_update(&self, id: &str, props: &Props, increase: bool) -> Option<BuildOperation> {
        let mut id = id.to_string();
        let mut props = props.clone();

        let component = match self.document.get(&id) {
            Some(component) => Some(component),
            None => match self.repair(&id) {
                Repair::NotApplicable => None,
                Repair::Resolved(target) => {
                    tracing::debug!("Repaired update target '{}' -> '{}'", id, target);
                    id = target;
                    self.document.get(&id)
                }
                Repair::Unresolved => {
                    tracing::debug!("Dropping update for unresolvable id '{}'", id);
                    return None;
                }
            },
        };

        if let Some(component) = component {
            self.resolve_size(component, &mut props, increase);
            props.retain(|key, value| {
                CLASS_NAME_KEYS.contains(&key.as_str())
                    || !component.props.get(key).is_some_and(|current| same_json(current, value))
            });
        }

        if props.is_empty() {
            return None;
        }
        Some(BuildOperation::Update { id, props })
    }

    fn repair(&self, id: &str) -> Repair {
        self.repairs
            .iter()
            .map(|strategy| strategy.repair(id, self.document))
            .find(|repair| *repair != Repair::NotApplicable)
            .unwrap_or(Repair::NotApplicable)
    }

    fn resolve_size(&self, component: &PageComponent, props: &mut Props, increase: bool) {
        let requested = props.get("size").and_then(Value::as_str);
        if requested == Some("") {
            // Empty string clears the size.
            return;
        }
        if !increase {
            return;
        }

        let options = self
            .catalog
            .field_options(&component.component_type, "size");
        if options.is_empty() {
            return;
        }

        let current = component
            .props
            .get("size")
            .and_then(Value::as_str)
            .or_else(|| {
                self.catalog
                    .default_props(&component.component_type)
                    .and_then(|p| p.get("size"))
                    .and_then(Value::as_str)
            });

        let needs_step = match requested {
            None => true,
            Some(requested) => {
                Some(requested) == current || !options.iter().any(|o| o == requested)
            }
        };
        if !needs_step {
            return;
        }

        let Some(position) = current.and_then(|c| options.iter().position(|o| o == c)) else {
            return;
        };
        match options.get(position + 1) {
            Some(next) => {
                props.insert("size".to_string(), Value::String(next.clone()));
            }
            None => {
                props.remove("size");
            }
        }
    }
}

/// Equality as seen by the editor after serialization: numbers compare by
/// value, so `1` and `1.0` are the same prop.
fn same_json(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x == y || x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| same_json(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(key, a)| y.get(key).is_some_and(|b| same_json(a, b)))
        }
        _ => a == b,
    }
}

/// Normalize with the default repair strategies.
pub fn normalize(
    batch: &[BuildOperation],
    description: &str,
    document: &DocumentIndex,
    catalog: &ComponentCatalog,
) -> Vec<BuildOperation> {
    Normalizer::new(document, catalog).normalize(batch, description)
}
