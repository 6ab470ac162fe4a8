//! Modification rule documents.
//!
//! A `ModificationRules` record is the unit of mutation in the layered
//! rule model. The same shape applies to header maps and JSON
//! bodies; the `default` verb is only meaningful for bodies.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A set of mutations applied to a header map or JSON object.
///
/// Verbs execute in a fixed order: `add`, `replace`, `default`, `remove`.
/// Values may contain `{{ … }}` expression markers evaluated against the
/// request context at application time.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ModificationRules {
    /// Assign unconditionally, overriding existing entries.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub add: Map<String, Value>,

    /// Assign only to keys already present (or just added).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub replace: Map<String, Value>,

    /// Assign only when the key is currently absent (bodies only).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub default: Map<String, Value>,

    /// Delete the listed keys, unless `add`/`replace` touched them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

impl ModificationRules {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty()
            && self.replace.is_empty()
            && self.default.is_empty()
            && self.remove.is_empty()
    }

    /// Deep-merge two rule sets, `inner` winning on conflicting keys.
    ///
    /// The verb maps are key-merged; `remove` lists are concatenated and
    /// de-duplicated preserving first occurrence. The operation is
    /// associative, which lets the pipeline compose layers pairwise.
    pub fn deep_merge(outer: &ModificationRules, inner: &ModificationRules) -> ModificationRules {
        let mut merged = outer.clone();
        for (k, v) in &inner.add {
            merged.add.insert(k.clone(), v.clone());
        }
        for (k, v) in &inner.replace {
            merged.replace.insert(k.clone(), v.clone());
        }
        for (k, v) in &inner.default {
            merged.default.insert(k.clone(), v.clone());
        }
        for key in &inner.remove {
            if !merged.remove.contains(key) {
                merged.remove.push(key.clone());
            }
        }
        merged
    }

    /// Merge two optional layers into one rule set.
    pub fn merge_opt(
        outer: Option<&ModificationRules>,
        inner: Option<&ModificationRules>,
    ) -> ModificationRules {
        match (outer, inner) {
            (Some(o), Some(i)) => Self::deep_merge(o, i),
            (Some(o), None) => o.clone(),
            (None, Some(i)) => i.clone(),
            (None, None) => ModificationRules::default(),
        }
    }
}
