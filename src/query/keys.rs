//! Attribute path translation.
//!
//! Stored paths differ from model paths in two ways: attributes declared
//! by a mixin live under the mixin's namespace key, and joined documents
//! live under a `<key>_lookup` alias until the lookup fill pass runs.

use std::collections::BTreeSet;

use crate::model::document::ID_FIELD;
use crate::model::{ClassRef, Hierarchy};
use crate::query::LOOKUP_MARKER;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedKey {
    pub path: String,
    /// Path reads joined documents, so it can only be matched after the join
    pub joined: bool,
}

/// Alias under which a forward join on `key` is materialized
pub fn forward_alias(key: &str) -> String {
    format!("{}_lookup", key.replace('.', "_"))
}

/// Alias under which a reverse join named `key` is materialized
pub fn reverse_alias(key: &str) -> String {
    format!("{}_{}_lookup", ID_FIELD, key.replace('.', "_"))
}

/// Translate a model path on `class` into its stored path.
///
/// Mixin attributes found on the way are added to `mixins`. Translating an
/// already translated path returns it unchanged.
pub fn translate_key(
    hierarchy: &dyn Hierarchy,
    key: &str,
    class: &str,
    mixins: Option<&mut BTreeSet<ClassRef>>,
) -> TranslatedKey {
    let segments: Vec<&str> = key.split('.').filter(|s| !s.is_empty()).collect();
    if segments.first() == Some(&LOOKUP_MARKER) {
        let rest = &segments[1..];
        let (alias, tail) = match rest {
            [id, name, tail @ ..] if *id == ID_FIELD => (reverse_alias(name), tail),
            [name, tail @ ..] => (forward_alias(name), tail),
            [] => (String::new(), rest),
        };
        let mut path = alias;
        for segment in tail {
            path.push('.');
            path.push_str(segment);
        }
        return TranslatedKey { path, joined: true };
    }

    if key.contains('.') {
        return TranslatedKey {
            path: key.to_string(),
            joined: false,
        };
    }

    match hierarchy.resolve_attribute(class, key) {
        Some(resolved) => match resolved.mixin() {
            Some(owner) => {
                let path = format!("{}.{}", owner, key);
                if let Some(mixins) = mixins {
                    mixins.insert(owner.clone());
                }
                TranslatedKey {
                    path,
                    joined: false,
                }
            }
            None => TranslatedKey {
                path: key.to_string(),
                joined: false,
            },
        },
        None => TranslatedKey {
            path: key.to_string(),
            joined: false,
        },
    }
}
