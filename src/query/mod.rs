//! Hierarchy-aware queries compiled to the native dialect.
//!
//! A query names a class, a filter over that class's attributes and a set
//! of [`FindOptions`]. Compilation happens in stages:
//! - [`keys`] rewrites attribute paths to their stored location
//! - [`filter`] scopes the filter to the class and its descendants
//! - [`lookup`] plans joins against other domains and fills their results
//! - [`sort`] turns enum, date and rule-based orderings into computed fields
//! - [`executor`] chooses between a plain find and an aggregation pipeline

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AdapterError, AdapterResult};
use crate::model::{ClassRef, Document, Domain};
use crate::native::SortOrder;

pub mod executor;
pub mod filter;
pub mod keys;
pub mod lookup;
pub mod sort;

pub use executor::QueryExecutor;
pub use filter::{compile_filter, CompiledFilter};
pub use keys::{translate_key, TranslatedKey};
pub use lookup::{plan_lookups, LookupStep};
pub use sort::{plan_sort, SortPlan};

/// Path segment addressing joined documents, as in `$lookup.space.name`
pub const LOOKUP_MARKER: &str = "$lookup";

/// Parent-reference attribute used by reverse lookups without an explicit one
pub const DEFAULT_REVERSE_ATTRIBUTE: &str = "attachedTo";

/// One ranked case of a custom ordering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortCase {
    /// Selector on the sorted field: a literal, or `$in` / `$nin` / `$ne`
    pub query: Value,
    pub index: i64,
}

/// Custom ordering: the first matching case gives the rank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortRules {
    pub order: SortOrder,
    pub cases: Vec<SortCase>,
    /// Rank of values matching no case; defaults to the number of cases
    #[serde(default)]
    pub default: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SortSpec {
    Order(SortOrder),
    Rules(SortRules),
}

impl SortSpec {
    pub fn order(&self) -> SortOrder {
        match self {
            SortSpec::Order(order) => *order,
            SortSpec::Rules(rules) => rules.order,
        }
    }
}

/// Forward join: the attribute holds the id of a `class` document
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardLookup {
    pub class: ClassRef,
    pub nested: Option<LookupSpec>,
}

/// Reverse join: `class` documents referencing this one through `attribute`
#[derive(Debug, Clone, PartialEq)]
pub struct ReverseLookup {
    pub class: ClassRef,
    pub attribute: Option<String>,
}

/// What to join onto each result, keyed by attribute (forward) or by an
/// output name (reverse).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LookupSpec {
    pub forward: Vec<(String, ForwardLookup)>,
    pub reverse: Vec<(String, ReverseLookup)>,
}

impl LookupSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty() && self.reverse.is_empty()
    }

    pub fn forward(mut self, key: &str, class: &str) -> Self {
        self.forward.push((
            key.to_string(),
            ForwardLookup {
                class: class.to_string(),
                nested: None,
            },
        ));
        self
    }

    pub fn forward_nested(mut self, key: &str, class: &str, nested: LookupSpec) -> Self {
        self.forward.push((
            key.to_string(),
            ForwardLookup {
                class: class.to_string(),
                nested: Some(nested),
            },
        ));
        self
    }

    pub fn reverse(mut self, key: &str, class: &str, attribute: Option<&str>) -> Self {
        self.reverse.push((
            key.to_string(),
            ReverseLookup {
                class: class.to_string(),
                attribute: attribute.map(str::to_string),
            },
        ));
        self
    }

    /// Parse the JSON form:
    /// `{"space": "core:class:Space", "assignee": ["contact:class:Person", {...}],
    ///   "_id": {"comments": "chunter:class:Comment", "links": ["core:class:Link", "target"]}}`
    pub fn from_value(value: &Value) -> AdapterResult<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| AdapterError::InvalidQuery("lookup must be an object".to_string()))?;
        let mut spec = LookupSpec::new();
        for (key, entry) in map {
            if key == crate::model::document::ID_FIELD {
                let reverse = entry.as_object().ok_or_else(|| {
                    AdapterError::InvalidQuery("reverse lookup must be an object".to_string())
                })?;
                for (name, target) in reverse {
                    let (class, attribute) = match target {
                        Value::String(class) => (class.as_str(), None),
                        Value::Array(pair) => match pair.as_slice() {
                            [Value::String(class)] => (class.as_str(), None),
                            [Value::String(class), Value::String(attr)] => {
                                (class.as_str(), Some(attr.as_str()))
                            }
                            _ => {
                                return Err(AdapterError::InvalidQuery(format!(
                                    "bad reverse lookup for '{}'",
                                    name
                                )))
                            }
                        },
                        _ => {
                            return Err(AdapterError::InvalidQuery(format!(
                                "bad reverse lookup for '{}'",
                                name
                            )))
                        }
                    };
                    spec = spec.reverse(name, class, attribute);
                }
                continue;
            }
            spec = match entry {
                Value::String(class) => spec.forward(key, class),
                Value::Array(pair) => match pair.as_slice() {
                    [Value::String(class)] => spec.forward(key, class),
                    [Value::String(class), nested] => {
                        spec.forward_nested(key, class, LookupSpec::from_value(nested)?)
                    }
                    _ => {
                        return Err(AdapterError::InvalidQuery(format!(
                            "bad lookup for '{}'",
                            key
                        )))
                    }
                },
                _ => {
                    return Err(AdapterError::InvalidQuery(format!(
                        "bad lookup for '{}'",
                        key
                    )))
                }
            };
        }
        Ok(spec)
    }
}

/// Options of [`QueryExecutor::find_all`]
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub lookup: Option<LookupSpec>,
    /// Sort keys in priority order
    pub sort: Vec<(String, SortSpec)>,
    pub limit: Option<usize>,
    /// Attribute paths to return; `_id` and `_class` are always included
    pub projection: Option<Vec<String>>,
    /// Also compute the number of matches ignoring `limit`
    pub total: bool,
    pub skip_space: bool,
    pub skip_class: bool,
    /// Query this domain instead of the class's own
    pub domain: Option<Domain>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn sort(mut self, key: &str, order: SortOrder) -> Self {
        self.sort.push((key.to_string(), SortSpec::Order(order)));
        self
    }

    pub fn sort_rules(mut self, key: &str, rules: SortRules) -> Self {
        self.sort.push((key.to_string(), SortSpec::Rules(rules)));
        self
    }

    pub fn lookup(mut self, lookup: LookupSpec) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn projection(mut self, fields: &[&str]) -> Self {
        self.projection = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn with_total(mut self) -> Self {
        self.total = true;
        self
    }

    pub fn skip_class(mut self) -> Self {
        self.skip_class = true;
        self
    }

    pub fn skip_space(mut self) -> Self {
        self.skip_space = true;
        self
    }

    pub fn domain(mut self, domain: &str) -> Self {
        self.domain = Some(domain.to_string());
        self
    }
}

/// Documents returned by a query, plus the total when requested
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FindResult {
    pub documents: Vec<Document>,
    pub total: Option<u64>,
}

/// Convenience for building filters from `json!` literals
pub fn query_map(value: Value) -> AdapterResult<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(AdapterError::InvalidQuery(format!(
            "query must be an object, got {}",
            other
        ))),
    }
}
