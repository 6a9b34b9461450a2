//! Incremental emission of build operations from a growing `build` array.
//!
//! The session re-parses the whole argument text after every delta, so every
//! element already seen shows up again on each call. Only the tail is looked
//! at: the last element, plus every element that became complete because a
//! newer one started after it. Whatever survives validation, normalization and
//! the reference checks is emitted once per distinct content.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use super::events::StreamEvent;
use crate::catalog::ComponentCatalog;
use crate::ops::normalize::Normalizer;
use crate::ops::{BuildOperation, DocumentIndex, OpKind, Props};

/// Per-tool-call dedupe bookkeeping.
#[derive(Debug, Default)]
struct CallState {
    reset_sent: bool,
    /// Ids the client has rendered: the snapshot plus adds emitted so far.
    known_ids: HashSet<String>,
    added: HashSet<String>,
    /// Slot content each emitted add carried.
    add_content: HashMap<String, String>,
    /// Last JSON sent per (op kind, component id or "root").
    signatures: HashMap<(OpKind, String), String>,
    last_len: usize,
    emitted: Vec<BuildOperation>,
}

/// Dedupe state for one response, keyed by tool call id.
#[derive(Debug, Default)]
pub struct StreamDedupeState {
    calls: HashMap<String, CallState>,
}

impl StreamDedupeState {
    fn call(&mut self, tool_call_id: &str, document: &DocumentIndex) -> &mut CallState {
        self.calls
            .entry(tool_call_id.to_string())
            .or_insert_with(|| CallState {
                known_ids: document.ids().map(str::to_string).collect(),
                ..CallState::default()
            })
    }
}

pub struct IncrementalOpEmitter {
    document: Arc<DocumentIndex>,
    catalog: Arc<ComponentCatalog>,
    state: StreamDedupeState,
}

impl IncrementalOpEmitter {
    pub fn new(document: Arc<DocumentIndex>, catalog: Arc<ComponentCatalog>) -> Self {
        Self {
            document,
            catalog,
            state: StreamDedupeState::default(),
        }
    }

    /// Handle the `build` array as parsed from a still-growing argument text.
    pub fn process_partial_build_array(
        &mut self,
        partial: &[Value],
        tool_call_id: &str,
        description: &str,
    ) -> Vec<StreamEvent> {
        self.process(partial, tool_call_id, description, false)
    }

    /// Handle the final, strictly parsed `build` array once the call completed.
    pub fn flush(&mut self, complete: &[Value], tool_call_id: &str, description: &str) -> Vec<StreamEvent> {
        self.process(complete, tool_call_id, description, true)
    }

    /// Operations emitted so far for a tool call, in emission order.
    pub fn emitted(&self, tool_call_id: &str) -> &[BuildOperation] {
        self.state
            .calls
            .get(tool_call_id)
            .map(|call| call.emitted.as_slice())
            .unwrap_or_default()
    }

    fn process(
        &mut self,
        array: &[Value],
        tool_call_id: &str,
        description: &str,
        final_pass: bool,
    ) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if array.is_empty() {
            return events;
        }

        let call = self.state.call(tool_call_id, &self.document);

        // Reset goes out before anything else of this call.
        if !call.reset_sent && array.iter().any(is_reset) {
            call.reset_sent = true;
            call.known_ids.clear();
            call.added.clear();
            call.add_content.clear();
            call.signatures.clear();
            call.emitted.push(BuildOperation::Reset);
            events.push(StreamEvent::build_op(BuildOperation::Reset));
        }

        let len = array.len();
        let start = if len > call.last_len {
            call.last_len.saturating_sub(1)
        } else {
            len - 1
        };
        call.last_len = call.last_len.max(len);

        let normalizer = Normalizer::new(&self.document, &self.catalog);
        for (offset, element) in array[start..].iter().enumerate() {
            let complete = final_pass || start + offset + 1 < len;
            consider(call, &normalizer, element, complete, description, &mut events);
        }
        events
    }
}

fn is_reset(element: &Value) -> bool {
    element.get("op").and_then(Value::as_str) == Some("reset")
}

fn consider(
    call: &mut CallState,
    normalizer: &Normalizer<'_>,
    element: &Value,
    complete: bool,
    description: &str,
    events: &mut Vec<StreamEvent>,
) {
    let Some(op) = BuildOperation::from_value(element) else {
        if complete {
            tracing::debug!("Dropping invalid build element: {}", element);
        }
        return;
    };

    // A trailing add/move may still be waiting for its zone; defaulting it to
    // the root now would place the component before the real zone arrives.
    if !complete
        && matches!(op.kind(), OpKind::Add | OpKind::Move)
        && element.get("zone").is_none()
    {
        return;
    }

    match op {
        BuildOperation::Reset => {}
        BuildOperation::Add {
            component_type,
            id,
            props,
            index,
            zone,
        } => {
            let (content, mut extra): (Props, Props) =
                props.into_iter().partition(|(key, _)| key == "content");

            if !call.added.contains(&id) {
                if call.known_ids.contains(&id) {
                    tracing::debug!("Dropping add for existing id '{}'", id);
                    return;
                }
                call.added.insert(id.clone());
                call.known_ids.insert(id.clone());
                call.add_content
                    .insert(id.clone(), Value::Object(content.clone()).to_string());
                send(
                    call,
                    BuildOperation::Add {
                        component_type,
                        id: id.clone(),
                        props: content,
                        index,
                        zone,
                    },
                    events,
                );
            } else if complete
                && !content.is_empty()
                && call.add_content.get(&id) != Some(&Value::Object(content.clone()).to_string())
            {
                // The add went out before its slot content was written.
                extra.extend(content);
            }

            if !extra.is_empty() {
                send_update(call, None, id, extra, description, events);
            }
        }
        BuildOperation::Update { id, props } => {
            send_update(call, Some(normalizer), id, props, description, events);
        }
        BuildOperation::Move { ref id, .. } => {
            if !call.known_ids.contains(id) {
                tracing::debug!("Dropping move of unknown id '{}'", id);
                return;
            }
            send(call, op, events);
        }
        BuildOperation::Delete { ref id } => {
            if !call.known_ids.contains(id) {
                tracing::debug!("Dropping delete of unknown id '{}'", id);
                return;
            }
            let id = id.clone();
            if send(call, op, events) {
                call.known_ids.remove(&id);
                call.added.remove(&id);
                call.add_content.remove(&id);
                call.signatures.retain(|(_, target), _| *target != id);
            }
        }
        BuildOperation::UpdateRoot { .. } => {
            send(call, op, events);
        }
    }
}

/// Updates of components created in this call skip normalization: they are
/// not in the snapshot, so id repair would misdirect them.
fn send_update(
    call: &mut CallState,
    normalizer: Option<&Normalizer<'_>>,
    id: String,
    props: Props,
    description: &str,
    events: &mut Vec<StreamEvent>,
) {
    let op = BuildOperation::Update { id, props };
    let op = match normalizer {
        Some(normalizer) if !call.added.contains(op.target_id().unwrap_or_default()) => {
            match normalizer.normalize(std::slice::from_ref(&op), description).pop() {
                Some(op) => op,
                None => return,
            }
        }
        _ => op,
    };

    let BuildOperation::Update { ref id, ref props } = op else {
        return;
    };
    if !call.known_ids.contains(id) {
        tracing::debug!("Dropping update of unknown id '{}'", id);
        return;
    }
    if props.values().all(is_blank) {
        return;
    }
    send(call, op, events);
}

fn is_blank(value: &Value) -> bool {
    value.as_str().is_some_and(|s| s.trim().is_empty())
}

/// Emit unless the same content was the last one sent for this key.
fn send(call: &mut CallState, op: BuildOperation, events: &mut Vec<StreamEvent>) -> bool {
    let key = (
        op.kind(),
        op.target_id().unwrap_or("root").to_string(),
    );
    let signature = op.to_value().to_string();
    if call.signatures.get(&key) == Some(&signature) {
        return false;
    }
    call.signatures.insert(key, signature);
    call.emitted.push(op.clone());
    events.push(StreamEvent::build_op(op));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::ROOT_ZONE;
    use serde_json::json;

    fn emitter() -> IncrementalOpEmitter {
        let document = DocumentIndex::from_page_data(Some(&json!({
            "content": [
                {"type": "Heading", "props": {"id": "h1", "title": "Hello", "size": "sm"}},
                {"type": "Text", "props": {"id": "t1", "text": "Body"}}
            ]
        })));
        let catalog = ComponentCatalog::from_config(Some(&json!({
            "components": {"Heading": {"fields": {"size": {"type": "select", "options": ["sm", "md", "lg"]}}}}
        })));
        IncrementalOpEmitter::new(Arc::new(document), Arc::new(catalog))
    }

    fn ops(events: &[StreamEvent]) -> Vec<BuildOperation> {
        events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::DataBuildOp { data, transient } => {
                    assert!(*transient);
                    Some(data.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn update(id: &str, props: Value) -> BuildOperation {
        BuildOperation::Update {
            id: id.to_string(),
            props: props.as_object().unwrap().clone(),
        }
    }

    #[test]
    fn identical_operation_is_sent_once() {
        let mut emitter = emitter();
        let array = vec![json!({"op": "update", "id": "h1", "props": {"title": "Hi"}})];
        let first = emitter.process_partial_build_array(&array, "c1", "edit");
        let second = emitter.process_partial_build_array(&array, "c1", "edit");
        assert_eq!(ops(&first), vec![update("h1", json!({"title": "Hi"}))]);
        assert!(second.is_empty());
    }

    #[test]
    fn growing_last_element_is_re_emitted_with_new_content() {
        let mut emitter = emitter();
        let a = vec![json!({"op": "update", "id": "h1", "props": {"title": "Hi"}})];
        let b = vec![json!({"op": "update", "id": "h1", "props": {"title": "Hi", "text": "x"}})];
        emitter.process_partial_build_array(&a, "c1", "edit");
        let events = emitter.process_partial_build_array(&b, "c1", "edit");
        assert_eq!(ops(&events), vec![update("h1", json!({"title": "Hi", "text": "x"}))]);
    }

    #[test]
    fn reset_fires_once_and_first() {
        let mut emitter = emitter();
        let a = vec![json!({"op": "delete", "id": "h1"}), json!({"op": "reset"})];
        let events = emitter.process_partial_build_array(&a, "c1", "start over");
        assert_eq!(ops(&events)[0], BuildOperation::Reset);

        let b = vec![
            json!({"op": "delete", "id": "h1"}),
            json!({"op": "reset"}),
            json!({"op": "reset"}),
        ];
        let events = emitter.process_partial_build_array(&b, "c1", "start over");
        assert!(ops(&events).iter().all(|op| *op != BuildOperation::Reset));
        let events = emitter.flush(&b, "c1", "start over");
        assert!(ops(&events).is_empty());

        let resets = emitter
            .emitted("c1")
            .iter()
            .filter(|op| **op == BuildOperation::Reset)
            .count();
        assert_eq!(resets, 1);
        // After the reset the snapshot ids are gone, so the delete never goes out.
        assert!(!emitter.emitted("c1").contains(&BuildOperation::Delete { id: "h1".to_string() }));
    }

    #[test]
    fn references_to_unknown_ids_are_rejected() {
        let mut emitter = emitter();
        let array = vec![
            json!({"op": "update", "id": "ghost", "props": {"title": "x"}}),
            json!({"op": "move", "id": "ghost", "index": 0, "zone": ROOT_ZONE}),
            json!({"op": "delete", "id": "ghost"}),
        ];
        let events = emitter.flush(&array, "c1", "edit");
        assert!(events.is_empty());
    }

    #[test]
    fn add_makes_id_known_for_later_operations() {
        let mut emitter = emitter();
        let array = vec![
            json!({"op": "add", "type": "Card", "id": "card-1", "index": 2, "zone": ROOT_ZONE}),
            json!({"op": "update", "id": "card-1", "props": {"title": "New"}}),
            json!({"op": "move", "id": "card-1", "index": 0, "zone": "s1:content"}),
        ];
        let events = emitter.flush(&array, "c1", "add a card");
        let kinds: Vec<OpKind> = ops(&events).iter().map(BuildOperation::kind).collect();
        assert_eq!(kinds, vec![OpKind::Add, OpKind::Update, OpKind::Move]);
    }

    #[test]
    fn add_with_extra_props_is_split_into_add_then_update() {
        let mut emitter = emitter();
        let array = vec![json!({
            "op": "add", "type": "Section", "id": "sec", "index": 0, "zone": ROOT_ZONE,
            "props": {"title": "About", "content": [], "theme": "dark"}
        })];
        let events = emitter.flush(&array, "c1", "add section");
        assert_eq!(
            ops(&events),
            vec![
                BuildOperation::Add {
                    component_type: "Section".to_string(),
                    id: "sec".to_string(),
                    props: json!({"content": []}).as_object().unwrap().clone(),
                    index: 0,
                    zone: ROOT_ZONE.to_string(),
                },
                update("sec", json!({"title": "About", "theme": "dark"})),
            ]
        );
    }

    #[test]
    fn streamed_add_is_sent_once_while_its_props_grow() {
        let mut emitter = emitter();
        let base = json!({"op": "add", "type": "Hero", "id": "hero", "index": 0, "zone": ROOT_ZONE});
        let mut with_title = base.clone();
        with_title["props"] = json!({"title": "Wel"});
        let mut with_more = base.clone();
        with_more["props"] = json!({"title": "Welcome"});

        let mut all = Vec::new();
        for element in [base, with_title, with_more] {
            all.extend(ops(&emitter.process_partial_build_array(&[element], "c1", "hero")));
        }
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].kind(), OpKind::Add);
        assert_eq!(all[1], update("hero", json!({"title": "Wel"})));
        assert_eq!(all[2], update("hero", json!({"title": "Welcome"})));
    }

    #[test]
    fn trailing_add_without_zone_waits() {
        let mut emitter = emitter();
        let partial = vec![json!({"op": "add", "type": "Card", "id": "c", "index": 0})];
        assert!(emitter.process_partial_build_array(&partial, "c1", "x").is_empty());

        let grown = vec![
            json!({"op": "add", "type": "Card", "id": "c", "index": 0, "zone": "s1:content"}),
            json!({"op": "delete"}),
        ];
        let events = emitter.process_partial_build_array(&grown, "c1", "x");
        assert!(matches!(&ops(&events)[..], [BuildOperation::Add { zone, .. }] if zone == "s1:content"));
    }

    #[test]
    fn blank_and_no_op_updates_are_dropped() {
        let mut emitter = emitter();
        let array = vec![
            json!({"op": "update", "id": "h1", "props": {"title": "   "}}),
            json!({"op": "update", "id": "t1", "props": {"text": "Body"}}),
            json!({"op": "update", "id": "t1", "props": {}}),
        ];
        assert!(emitter.flush(&array, "c1", "edit").is_empty());
    }

    #[test]
    fn updates_are_normalized_before_emission() {
        let mut emitter = emitter();
        let array = vec![json!({"op": "update", "id": "h1", "props": {"size": "sm"}})];
        let events = emitter.flush(&array, "c1", "make the heading bigger");
        assert_eq!(ops(&events), vec![update("h1", json!({"size": "md"}))]);
    }

    #[test]
    fn only_the_tail_of_the_array_is_reconsidered() {
        let mut emitter = emitter();
        let first = vec![
            json!({"op": "update", "id": "h1", "props": {"title": "A"}}),
            json!({"op": "update", "id": "h1", "props": {"title": "B"}}),
        ];
        let events = emitter.process_partial_build_array(&first, "c1", "edit");
        assert_eq!(ops(&events).len(), 2);

        let mut second = first.clone();
        second.push(json!({"op": "update", "id": "t1", "props": {"text": "C"}}));
        let events = emitter.process_partial_build_array(&second, "c1", "edit");
        // Element 0 is not revisited, so title "A" is never re-sent over "B".
        assert_eq!(ops(&events), vec![update("t1", json!({"text": "C"}))]);
    }

    #[test]
    fn slot_content_written_after_zone_reaches_the_client() {
        let text = r#"{"description":"add section","build":[{"op":"add","type":"Section","id":"s","index":0,"zone":"root:default-zone","props":{"content":[{"type":"Heading","props":{"id":"s-h","title":"Team"}}]}}]}"#;
        let mut emitter = emitter();
        let mut sent = Vec::new();
        for end in (0..text.len()).filter(|end| text.is_char_boundary(*end)) {
            let Some(parsed) = crate::partial_json::parse_settled(&text[..end]) else {
                continue;
            };
            if let Some(build) = parsed.get("build").and_then(Value::as_array) {
                sent.extend(ops(&emitter.process_partial_build_array(build, "c1", "add section")));
            }
        }
        let complete: Value = serde_json::from_str(text).unwrap();
        let build = complete["build"].as_array().unwrap();
        sent.extend(ops(&emitter.flush(build, "c1", "add section")));

        assert_eq!(sent.iter().filter(|op| op.kind() == OpKind::Add).count(), 1);
        let last_content = sent
            .iter()
            .rev()
            .find_map(|op| match op {
                BuildOperation::Add { props, .. } | BuildOperation::Update { props, .. } => {
                    props.get("content").cloned()
                }
                _ => None,
            });
        assert_eq!(last_content, Some(build[0]["props"]["content"].clone()));
    }

    #[test]
    fn deleted_id_can_be_added_and_deleted_again() {
        let mut emitter = emitter();
        let add = json!({"op": "add", "type": "Card", "id": "x", "index": 0, "zone": ROOT_ZONE});
        let delete = json!({"op": "delete", "id": "x"});
        let mut array = Vec::new();
        for element in [add.clone(), delete.clone(), add, delete] {
            array.push(element);
            emitter.process_partial_build_array(&array, "c1", "shuffle");
        }
        emitter.flush(&array, "c1", "shuffle");

        let kinds: Vec<OpKind> = emitter.emitted("c1").iter().map(BuildOperation::kind).collect();
        assert_eq!(kinds, vec![OpKind::Add, OpKind::Delete, OpKind::Add, OpKind::Delete]);
    }

    #[test]
    fn dedupe_state_is_per_tool_call() {
        let mut emitter = emitter();
        let array = vec![json!({"op": "update", "id": "h1", "props": {"title": "Hi"}})];
        assert_eq!(ops(&emitter.flush(&array, "c1", "edit")).len(), 1);
        assert_eq!(ops(&emitter.flush(&array, "c2", "edit")).len(), 1);
        assert_eq!(emitter.emitted("c2").len(), 1);
        assert!(emitter.emitted("c3").is_empty());
    }
}
