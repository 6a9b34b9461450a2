//! Page build operations.
//!
//! A build operation is one atomic edit of a page document. Operations reach
//! the backend as loosely-typed JSON from the model, so [`BuildOperation::from_value`]
//! is the single place where raw elements become typed operations. Anything
//! that fails validation is dropped, never reported.
//!
//! The document itself is a tree of `{type, id, props}` components where slot
//! children live under `props.content`. [`DocumentIndex`] flattens it for
//! id lookups; the backend never mutates it.

pub mod memory;
pub mod normalize;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Props = Map<String, Value>;

pub const ROOT_ZONE: &str = "root:default-zone";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum BuildOperation {
    Reset,
    UpdateRoot {
        props: Props,
    },
    Add {
        #[serde(rename = "type")]
        component_type: String,
        id: String,
        #[serde(default)]
        props: Props,
        index: u64,
        zone: String,
    },
    Update {
        id: String,
        props: Props,
    },
    Move {
        id: String,
        index: u64,
        zone: String,
    },
    Delete {
        id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Reset,
    UpdateRoot,
    Add,
    Update,
    Move,
    Delete,
}

impl BuildOperation {
    /// Validate a raw element and convert it into an operation.
    ///
    /// The zone of `add`/`move` is normalized before it is checked, so a
    /// missing or colon-less zone lands at the page root.
    pub fn from_value(raw: &Value) -> Option<Self> {
        let obj = raw.as_object()?;
        let op = obj.get("op")?.as_str()?;

        match op {
            "reset" => Some(BuildOperation::Reset),
            "updateRoot" => Some(BuildOperation::UpdateRoot {
                props: obj.get("props")?.as_object()?.clone(),
            }),
            "add" => {
                let zone = normalize_zone(obj.get("zone"));
                if !is_valid_zone(&zone) {
                    return None;
                }
                let props = match obj.get("props") {
                    None | Some(Value::Null) => Props::new(),
                    Some(value) => value.as_object()?.clone(),
                };
                Some(BuildOperation::Add {
                    component_type: non_empty_str(obj.get("type"))?,
                    id: non_empty_str(obj.get("id"))?,
                    props,
                    index: index_of(obj.get("index"))?,
                    zone,
                })
            }
            "update" => Some(BuildOperation::Update {
                id: non_empty_str(obj.get("id"))?,
                props: obj.get("props")?.as_object()?.clone(),
            }),
            "move" => {
                let zone = normalize_zone(obj.get("zone"));
                if !is_valid_zone(&zone) {
                    return None;
                }
                Some(BuildOperation::Move {
                    id: non_empty_str(obj.get("id"))?,
                    index: index_of(obj.get("index"))?,
                    zone,
                })
            }
            "delete" => Some(BuildOperation::Delete {
                id: non_empty_str(obj.get("id"))?,
            }),
            _ => None,
        }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            BuildOperation::Reset => OpKind::Reset,
            BuildOperation::UpdateRoot { .. } => OpKind::UpdateRoot,
            BuildOperation::Add { .. } => OpKind::Add,
            BuildOperation::Update { .. } => OpKind::Update,
            BuildOperation::Move { .. } => OpKind::Move,
            BuildOperation::Delete { .. } => OpKind::Delete,
        }
    }

    /// Id of the component the operation targets, if it targets one.
    pub fn target_id(&self) -> Option<&str> {
        match self {
            BuildOperation::Add { id, .. }
            | BuildOperation::Update { id, .. }
            | BuildOperation::Move { id, .. }
            | BuildOperation::Delete { id } => Some(id),
            BuildOperation::Reset | BuildOperation::UpdateRoot { .. } => None,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Structural check of a raw element, without any document lookup.
pub fn is_valid_build_op(raw: &Value) -> bool {
    BuildOperation::from_value(raw).is_some()
}

/// A non-empty zone containing `:` passes through; anything else is the root zone.
pub fn normalize_zone(zone: Option<&Value>) -> String {
    match zone.and_then(Value::as_str) {
        Some(zone) if !zone.is_empty() && zone.contains(':') => zone.to_string(),
        _ => ROOT_ZONE.to_string(),
    }
}

/// `<parentId>:<slot>` with both halves present.
pub fn is_valid_zone(zone: &str) -> bool {
    matches!(zone.split_once(':'), Some((parent, slot)) if !parent.is_empty() && !slot.is_empty())
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

fn index_of(value: Option<&Value>) -> Option<u64> {
    let value = value?;
    if let Some(index) = value.as_u64() {
        return Some(index);
    }
    let float = value.as_f64()?;
    (float >= 0.0 && float.fract() == 0.0).then_some(float as u64)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageComponent {
    pub component_type: String,
    pub id: String,
    pub props: Props,
}

/// Id-indexed snapshot of a page document.
#[derive(Debug, Clone, Default)]
pub struct DocumentIndex {
    components: HashMap<String, PageComponent>,
    order: Vec<String>,
}

impl DocumentIndex {
    /// Walks `content` and every nested `props.content` array.
    pub fn from_page_data(page_data: Option<&Value>) -> Self {
        let mut index = Self::default();
        if let Some(content) = page_data
            .and_then(|data| data.get("content"))
            .and_then(Value::as_array)
        {
            index.collect(content);
        }
        index
    }

    fn collect(&mut self, items: &[Value]) {
        for item in items {
            let Some(obj) = item.as_object() else {
                continue;
            };
            let props = obj
                .get("props")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            // Puck keeps the id inside props; older snapshots carry it at the top.
            let id = props
                .get("id")
                .or_else(|| obj.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let component_type = obj
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            if let Some(children) = props.get("content").and_then(Value::as_array) {
                self.collect(children);
            }

            if let Some(id) = id {
                if !self.components.contains_key(&id) {
                    self.order.push(id.clone());
                }
                self.components.insert(
                    id.clone(),
                    PageComponent {
                        component_type,
                        id,
                        props,
                    },
                );
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&PageComponent> {
        self.components.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.components.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Components in document order (children before their parent).
    pub fn components(&self) -> impl Iterator<Item = &PageComponent> {
        self.order.iter().filter_map(|id| self.components.get(id))
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}
