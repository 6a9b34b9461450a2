//! Compact summaries of applied operation batches.
//!
//! A [`BuildMemory`] is returned as the `updatePage` tool result and carried in
//! later requests as conversational context, so it favours ids and counts over
//! full props.

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use super::BuildOperation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryNote {
    FullRebuild,
    HeroSectionPresent,
    LocalEditOnly,
    NoChangesApplied,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedComponent {
    pub id: String,
    #[serde(rename = "type")]
    pub component_type: String,
    pub zone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatedComponent {
    pub id: String,
    pub changed_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovedComponent {
    pub id: String,
    pub zone: String,
    pub index: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildMemory {
    pub applied_ops_count: usize,
    pub created: Vec<CreatedComponent>,
    pub updated: Vec<UpdatedComponent>,
    pub moved: Vec<MovedComponent>,
    pub deleted: Vec<String>,
    pub notes: BTreeSet<MemoryNote>,
    pub human_summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locale {
    English,
    German,
}

fn german_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(^|[^a-zäöüß])(bitte|und|der|die|das|mach|mache|seite|überschrift|ändere|ändern|füge|hinzu|nicht|für|mit|neue|neuen|größer|kleiner)([^a-zäöüß]|$)",
            )
            .ok()
        })
        .as_ref()
}

/// Guess the user's language from the request text.
///
/// Keyword sniffing only: German if any common German word appears, English
/// otherwise. Short or mixed-language requests can be misclassified.
pub fn detect_locale(text: &str) -> Locale {
    let lowered = text.to_lowercase();
    if german_pattern().is_some_and(|re| re.is_match(&lowered)) {
        Locale::German
    } else {
        Locale::English
    }
}

/// Summarize an applied batch. `description` only selects the summary language.
pub fn summarize(batch: &[BuildOperation], description: &str) -> BuildMemory {
    let mut memory = BuildMemory {
        applied_ops_count: batch.len(),
        ..BuildMemory::default()
    };
    let mut updated_keys: Vec<(String, BTreeSet<String>)> = Vec::new();
    let mut updated_slots: HashMap<String, usize> = HashMap::new();
    let mut reset = false;
    let mut root_updates = 0usize;

    for op in batch {
        match op {
            BuildOperation::Reset => {
                reset = true;
                memory.notes.insert(MemoryNote::FullRebuild);
            }
            BuildOperation::UpdateRoot { .. } => root_updates += 1,
            BuildOperation::Add {
                component_type,
                id,
                zone,
                ..
            } => memory.created.push(CreatedComponent {
                id: id.clone(),
                component_type: component_type.clone(),
                zone: zone.clone(),
            }),
            BuildOperation::Update { id, props } => {
                if props.is_empty() {
                    continue;
                }
                let slot = *updated_slots.entry(id.clone()).or_insert_with(|| {
                    updated_keys.push((id.clone(), BTreeSet::new()));
                    updated_keys.len() - 1
                });
                updated_keys[slot].1.extend(props.keys().cloned());
            }
            BuildOperation::Move { id, index, zone } => memory.moved.push(MovedComponent {
                id: id.clone(),
                zone: zone.clone(),
                index: *index,
            }),
            BuildOperation::Delete { id } => memory.deleted.push(id.clone()),
        }
    }

    memory.updated = updated_keys
        .into_iter()
        .map(|(id, keys)| UpdatedComponent {
            id,
            changed_keys: keys.into_iter().collect(),
        })
        .collect();

    let mentions_hero = memory.created.iter().any(|c| {
        [&c.id, &c.component_type, &c.zone]
            .iter()
            .any(|field| field.to_lowercase().contains("hero"))
    });
    if mentions_hero {
        memory.notes.insert(MemoryNote::HeroSectionPresent);
    }
    if memory.created.is_empty()
        && memory.moved.is_empty()
        && memory.deleted.is_empty()
        && !reset
        && !memory.updated.is_empty()
    {
        memory.notes.insert(MemoryNote::LocalEditOnly);
    }
    if batch.is_empty() {
        memory.notes.insert(MemoryNote::NoChangesApplied);
    }

    memory.human_summary = human_summary(&memory, reset, root_updates, detect_locale(description));
    memory
}

fn human_summary(memory: &BuildMemory, reset: bool, root_updates: usize, locale: Locale) -> String {
    if memory.notes.contains(&MemoryNote::NoChangesApplied) {
        return match locale {
            Locale::English => "No changes were applied.".to_string(),
            Locale::German => "Es wurden keine Änderungen vorgenommen.".to_string(),
        };
    }

    let mut parts = Vec::new();
    let counts = [
        (memory.created.len(), "added {} component(s)", "{} Komponente(n) hinzugefügt"),
        (memory.updated.len(), "updated {} component(s)", "{} Komponente(n) aktualisiert"),
        (memory.moved.len(), "moved {} component(s)", "{} Komponente(n) verschoben"),
        (memory.deleted.len(), "deleted {} component(s)", "{} Komponente(n) gelöscht"),
    ];

    if reset {
        parts.push(match locale {
            Locale::English => "rebuilt the page from scratch".to_string(),
            Locale::German => "Seite komplett neu aufgebaut".to_string(),
        });
    }
    for (count, english, german) in counts {
        if count > 0 {
            let template = match locale {
                Locale::English => english,
                Locale::German => german,
            };
            parts.push(template.replace("{}", &count.to_string()));
        }
    }
    if root_updates > 0 {
        parts.push(match locale {
            Locale::English => "updated page settings".to_string(),
            Locale::German => "Seiteneinstellungen aktualisiert".to_string(),
        });
    }

    if parts.is_empty() {
        return match locale {
            Locale::English => "Page updated.".to_string(),
            Locale::German => "Seite aktualisiert.".to_string(),
        };
    }

    let mut sentence = parts.join(", ");
    if let Some(first) = sentence.get(..1) {
        let upper = first.to_uppercase();
        sentence.replace_range(..1, &upper);
    }
    sentence.push('.');
    sentence
}
