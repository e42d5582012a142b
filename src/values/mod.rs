//! The flat value store: a dotted-key map from a request/response field to
//! a [`ValueSlot`], with the overlay merge rules scenarios use to rewrite a
//! baseline. Mirrors the shape of the runner's `Context` (a flat map plus a
//! regex-driven placeholder scanner) but the placeholder grammar here is
//! `{{key}}` over a tagged-union value rather than `${...}` over a plain
//! string, and slots carry enough provenance to be re-emitted as artifact
//! variable bindings.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::errors::{ErrorCode, StructuredError};

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([A-Za-z0-9_.\[\]]+)\}\}").expect("valid placeholder regex"));

/// Sentinel written into an overlay to erase a key (and its descendants).
pub const UNDEFINED_SENTINEL: &str = "__undefined";

/// A value as it exists before resolution: either fixed, a pointer to a
/// prior execution's captured value, or literal text mixed with pointers.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueSlot {
    Literal(Value),
    /// The slot's entire string form was exactly one `{{key}}`.
    Dependent { key: String, template: String },
    /// Literal text interleaved with one or more `{{key}}` references.
    Composite { keys: Vec<String>, template: String },
}

impl ValueSlot {
    /// Classifies a raw value coming out of the oracle or a baseline
    /// capture: a string matching the whole-placeholder pattern becomes
    /// `Dependent`, a string containing any placeholder becomes
    /// `Composite`, everything else is `Literal`.
    pub fn from_value(value: Value) -> Self {
        if let Value::String(s) = &value {
            let matches: Vec<_> = PLACEHOLDER_RE.captures_iter(s).collect();
            if matches.len() == 1 {
                let m = &matches[0];
                if m.get(0).unwrap().as_str() == s.as_str() {
                    return ValueSlot::Dependent {
                        key: m.get(1).unwrap().as_str().to_string(),
                        template: s.clone(),
                    };
                }
            }
            if !matches.is_empty() {
                let keys = matches
                    .iter()
                    .map(|m| m.get(1).unwrap().as_str().to_string())
                    .collect();
                return ValueSlot::Composite {
                    keys,
                    template: s.clone(),
                };
            }
        }
        ValueSlot::Literal(value)
    }

    /// The original placeholder text, for re-emission in an artifact.
    pub fn placeholder_text(&self) -> Option<&str> {
        match self {
            ValueSlot::Literal(_) => None,
            ValueSlot::Dependent { template, .. } => Some(template),
            ValueSlot::Composite { template, .. } => Some(template),
        }
    }

    /// References this slot makes into the running value map.
    pub fn referenced_keys(&self) -> Vec<&str> {
        match self {
            ValueSlot::Literal(_) => vec![],
            ValueSlot::Dependent { key, .. } => vec![key.as_str()],
            ValueSlot::Composite { keys, .. } => keys.iter().map(String::as_str).collect(),
        }
    }

    /// Resolves the slot against `resolved`, a map from dotted key to an
    /// already-resolved leaf value. Fails with `DEPENDENCY_UNRESOLVED` if a
    /// referenced key is missing.
    pub fn resolve(&self, resolved: &BTreeMap<String, Value>) -> Result<Value, StructuredError> {
        match self {
            ValueSlot::Literal(v) => Ok(v.clone()),
            ValueSlot::Dependent { key, .. } => resolved.get(key).cloned().ok_or_else(|| {
                StructuredError::new(
                    ErrorCode::DEPENDENCY_UNRESOLVED,
                    format!("unresolved reference to '{}'", key),
                )
            }),
            ValueSlot::Composite { template, .. } => {
                let mut out = String::new();
                let mut last = 0;
                for cap in PLACEHOLDER_RE.captures_iter(template) {
                    let whole = cap.get(0).unwrap();
                    out.push_str(&template[last..whole.start()]);
                    let key = cap.get(1).unwrap().as_str();
                    let value = resolved.get(key).ok_or_else(|| {
                        StructuredError::new(
                            ErrorCode::DEPENDENCY_UNRESOLVED,
                            format!("unresolved reference to '{}'", key),
                        )
                    })?;
                    out.push_str(&to_plain_string(value));
                    last = whole.end();
                }
                out.push_str(&template[last..]);
                Ok(Value::String(out))
            }
        }
    }
}

fn to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A flat map from dotted key to [`ValueSlot`], with overlay application
/// per the merge rules: `__undefined` erases a key and its descendants; an
/// exact-key overlay replaces; a prefix overlay clears descendants first.
#[derive(Debug, Clone, Default)]
pub struct ValueStore {
    slots: BTreeMap<String, ValueSlot>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.slots.insert(key.into(), ValueSlot::from_value(value));
    }

    pub fn set_slot(&mut self, key: impl Into<String>, slot: ValueSlot) {
        self.slots.insert(key.into(), slot);
    }

    pub fn get(&self, key: &str) -> Option<&ValueSlot> {
        self.slots.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.slots.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ValueSlot)> {
        self.slots.iter()
    }

    /// Every slot resolved to a plain value, in dependency-free topological
    /// order (slots without prior dependents). Because dependent/composite
    /// slots only ever reference keys captured by prior steps, a single
    /// fixed-point pass over the already-resolved prefix map suffices in
    /// practice; any slot whose reference is not yet resolvable is retried
    /// once more at the end.
    pub fn resolved(&self) -> Result<BTreeMap<String, Value>, StructuredError> {
        let mut resolved = BTreeMap::new();
        let mut pending: Vec<&String> = self.slots.keys().collect();
        let mut progressed = true;
        while progressed && !pending.is_empty() {
            progressed = false;
            let mut still_pending = Vec::new();
            for key in pending {
                let slot = &self.slots[key];
                match slot.resolve(&resolved) {
                    Ok(v) => {
                        resolved.insert(key.clone(), v);
                        progressed = true;
                    }
                    Err(_) => still_pending.push(key),
                }
            }
            pending = still_pending;
        }
        if let Some(key) = pending.first() {
            return Err(StructuredError::new(
                ErrorCode::DEPENDENCY_UNRESOLVED,
                format!("could not resolve slot '{}'", key),
            )
            .with_context(crate::errors::ErrorContext {
                path: Some((*key).clone()),
                ..Default::default()
            }));
        }
        Ok(resolved)
    }

    /// Applies an overlay in the order its entries are given. See the
    /// module docs for the four merge rules.
    pub fn apply_overlay(&mut self, overlay: Vec<(String, OverlayValue)>) {
        for (key, value) in overlay {
            match value {
                OverlayValue::Undefined => self.remove_prefix(&key),
                OverlayValue::Set(slot) => {
                    if !self.slots.contains_key(&key) {
                        self.remove_descendants(&key);
                    }
                    self.slots.insert(key, slot);
                }
            }
        }
    }

    fn remove_prefix(&mut self, key: &str) {
        self.slots.remove(key);
        self.remove_descendants(key);
    }

    fn remove_descendants(&mut self, key: &str) {
        let dot_prefix = format!("{}.", key);
        let bracket_prefix = format!("{}[", key);
        self.slots
            .retain(|k, _| !(k.starts_with(&dot_prefix) || k.starts_with(&bracket_prefix)));
    }
}

/// One overlay entry's right-hand side: either the undefined sentinel or a
/// concrete slot to set.
#[derive(Debug, Clone)]
pub enum OverlayValue {
    Undefined,
    Set(ValueSlot),
}

impl OverlayValue {
    pub fn from_raw(value: Value) -> Self {
        if let Value::String(s) = &value {
            if s == UNDEFINED_SENTINEL {
                return OverlayValue::Undefined;
            }
        }
        OverlayValue::Set(ValueSlot::from_value(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_literal_dependent_composite() {
        assert!(matches!(
            ValueSlot::from_value(json!(42)),
            ValueSlot::Literal(_)
        ));
        assert!(matches!(
            ValueSlot::from_value(json!("{{createUser.response.body.userId}}")),
            ValueSlot::Dependent { .. }
        ));
        assert!(matches!(
            ValueSlot::from_value(json!("user-{{createUser.response.body.userId}}")),
            ValueSlot::Composite { .. }
        ));
    }

    #[test]
    fn resolves_dependent_value() {
        let mut store = ValueStore::new();
        store.set("createUser.response.body.userId", json!("abc-123"));
        store.set_slot(
            "getUser.request.path_params.userId",
            ValueSlot::from_value(json!("{{createUser.response.body.userId}}")),
        );
        let resolved = store.resolved().unwrap();
        assert_eq!(
            resolved.get("getUser.request.path_params.userId"),
            Some(&json!("abc-123"))
        );
    }

    #[test]
    fn unresolved_dependency_is_an_error() {
        let mut store = ValueStore::new();
        store.set_slot(
            "getUser.request.path_params.userId",
            ValueSlot::from_value(json!("{{missing.key}}")),
        );
        assert!(store.resolved().is_err());
    }

    #[test]
    fn undefined_overlay_erases_key_and_descendants() {
        let mut store = ValueStore::new();
        store.set("addPet.request.body.name", json!("Fido"));
        store.set("addPet.request.body.tags[0]", json!("a"));
        store.apply_overlay(vec![(
            "addPet.request.body".to_string(),
            OverlayValue::Undefined,
        )]);
        assert!(store.get("addPet.request.body.name").is_none());
        assert!(store.get("addPet.request.body.tags[0]").is_none());
    }

    #[test]
    fn prefix_overlay_clears_descendants_before_inserting() {
        let mut store = ValueStore::new();
        store.set("addPet.request.body.name", json!("Fido"));
        store.set("addPet.request.body.tags[0]", json!("a"));
        store.apply_overlay(vec![(
            "addPet.request.body".to_string(),
            OverlayValue::Set(ValueSlot::from_value(json!("not-an-object"))),
        )]);
        assert!(store.get("addPet.request.body.tags[0]").is_none());
        assert_eq!(
            store.get("addPet.request.body"),
            Some(&ValueSlot::Literal(json!("not-an-object")))
        );
    }

    #[test]
    fn exact_key_overlay_replaces_in_place() {
        let mut store = ValueStore::new();
        store.set("addPet.request.body.name", json!("Fido"));
        store.apply_overlay(vec![(
            "addPet.request.body.name".to_string(),
            OverlayValue::Set(ValueSlot::from_value(json!("Rex"))),
        )]);
        assert_eq!(
            store.get("addPet.request.body.name"),
            Some(&ValueSlot::Literal(json!("Rex")))
        );
    }
}
