//! Class hierarchy authority.
//!
//! The adapter only reads from the hierarchy: which domain a class lives in,
//! its descendants, whether it is a mixin, and attribute metadata. An
//! in-memory [`ClassHierarchy`] is provided for embedding and tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{AdapterError, AdapterResult};
use crate::model::document::{ClassRef, Document, Domain};

/// Root of every class hierarchy. Queries against it are never class-scoped.
pub const DOC_CLASS: &str = "core:class:Doc";

/// Domain holding model documents, which are served from memory instead of
/// the document database.
pub const MODEL_DOMAIN: &str = "model";

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeType {
    Plain,
    Date,
    /// Enumeration with its values in declared order
    Enum(Vec<String>),
    Ref(ClassRef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDef {
    pub name: String,
    /// Class (or mixin) declaring the attribute
    pub owner: ClassRef,
    pub kind: AttributeType,
}

/// Where an attribute lives on a stored document
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedAttribute {
    /// Stored at the top level of the document
    Base(AttributeDef),
    /// Stored inside the namespace of the owning mixin
    Mixin { owner: ClassRef, attribute: AttributeDef },
}

impl ResolvedAttribute {
    pub fn attribute(&self) -> &AttributeDef {
        match self {
            ResolvedAttribute::Base(attribute) => attribute,
            ResolvedAttribute::Mixin { attribute, .. } => attribute,
        }
    }

    pub fn mixin(&self) -> Option<&ClassRef> {
        match self {
            ResolvedAttribute::Base(_) => None,
            ResolvedAttribute::Mixin { owner, .. } => Some(owner),
        }
    }
}

/// Read-only class hierarchy consumed by the adapter
pub trait Hierarchy: Send + Sync {
    /// Storage domain of a class, inherited from the nearest ancestor declaring one
    fn domain(&self, class: &str) -> AdapterResult<Domain>;

    /// First non-mixin class in the ancestry of `class` (itself for plain classes)
    fn base_class(&self, class: &str) -> AdapterResult<ClassRef>;

    /// `class` and every class deriving from it, mixins included
    fn descendants(&self, class: &str) -> Vec<ClassRef>;

    fn is_mixin(&self, class: &str) -> bool;

    /// Attribute `key` declared on `class` or one of its ancestors
    fn find_attribute(&self, class: &str, key: &str) -> Option<AttributeDef>;

    fn resolve_attribute(&self, class: &str, key: &str) -> Option<ResolvedAttribute> {
        let attribute = self.find_attribute(class, key)?;
        if self.is_mixin(&attribute.owner) {
            Some(ResolvedAttribute::Mixin {
                owner: attribute.owner.clone(),
                attribute,
            })
        } else {
            Some(ResolvedAttribute::Base(attribute))
        }
    }

    /// Descendants of `class` that documents can actually be instances of
    fn concrete_descendants(&self, class: &str) -> Vec<ClassRef> {
        self.descendants(class)
            .into_iter()
            .filter(|c| !self.is_mixin(c))
            .collect()
    }
}

/// Source of model-domain documents for lookups that cannot be joined
pub trait ModelLookup: Send + Sync {
    fn find_one(&self, class: &str, id: &str) -> Option<Document>;
}

#[derive(Debug, Clone)]
struct ClassDef {
    extends: Option<ClassRef>,
    mixin: bool,
    domain: Option<Domain>,
    attributes: BTreeMap<String, AttributeDef>,
}

/// In-memory class hierarchy
#[derive(Debug, Clone)]
pub struct ClassHierarchy {
    classes: HashMap<ClassRef, ClassDef>,
    children: HashMap<ClassRef, BTreeSet<ClassRef>>,
}

impl ClassHierarchy {
    pub fn builder() -> ClassHierarchyBuilder {
        ClassHierarchyBuilder::new()
    }

    fn get(&self, class: &str) -> AdapterResult<&ClassDef> {
        self.classes
            .get(class)
            .ok_or_else(|| AdapterError::ClassNotFound(class.to_string()))
    }

    /// `class` followed by its ancestors, root last
    fn ancestry<'a>(&'a self, class: &'a str) -> impl Iterator<Item = (&'a str, &'a ClassDef)> + 'a {
        let mut next = Some(class);
        std::iter::from_fn(move || {
            let name = next?;
            let def = self.classes.get(name)?;
            next = def.extends.as_deref();
            Some((name, def))
        })
    }
}

impl Hierarchy for ClassHierarchy {
    fn domain(&self, class: &str) -> AdapterResult<Domain> {
        self.get(class)?;
        self.ancestry(class)
            .find_map(|(_, def)| def.domain.clone())
            .ok_or_else(|| AdapterError::DomainNotFound(class.to_string()))
    }

    fn base_class(&self, class: &str) -> AdapterResult<ClassRef> {
        self.get(class)?;
        self.ancestry(class)
            .find(|(_, def)| !def.mixin)
            .map(|(name, _)| name.to_string())
            .ok_or_else(|| AdapterError::ClassNotFound(class.to_string()))
    }

    fn descendants(&self, class: &str) -> Vec<ClassRef> {
        if !self.classes.contains_key(class) {
            return Vec::new();
        }
        let mut result = vec![class.to_string()];
        let mut i = 0;
        while i < result.len() {
            if let Some(children) = self.children.get(&result[i]) {
                result.extend(children.iter().cloned());
            }
            i += 1;
        }
        result
    }

    fn is_mixin(&self, class: &str) -> bool {
        self.classes.get(class).map(|def| def.mixin).unwrap_or(false)
    }

    fn find_attribute(&self, class: &str, key: &str) -> Option<AttributeDef> {
        self.ancestry(class)
            .find_map(|(_, def)| def.attributes.get(key).cloned())
    }
}

/// Builder for [`ClassHierarchy`]
#[derive(Debug, Default)]
pub struct ClassHierarchyBuilder {
    classes: HashMap<ClassRef, ClassDef>,
}

impl ClassHierarchyBuilder {
    pub fn new() -> Self {
        let mut classes = HashMap::new();
        classes.insert(
            DOC_CLASS.to_string(),
            ClassDef {
                extends: None,
                mixin: false,
                domain: None,
                attributes: BTreeMap::new(),
            },
        );
        Self { classes }
    }

    /// Register a class. `domain` may be omitted to inherit the parent's.
    pub fn class(mut self, name: &str, extends: &str, domain: Option<&str>) -> Self {
        self.classes.insert(
            name.to_string(),
            ClassDef {
                extends: Some(extends.to_string()),
                mixin: false,
                domain: domain.map(str::to_string),
                attributes: BTreeMap::new(),
            },
        );
        self
    }

    pub fn mixin(mut self, name: &str, extends: &str) -> Self {
        self.classes.insert(
            name.to_string(),
            ClassDef {
                extends: Some(extends.to_string()),
                mixin: true,
                domain: None,
                attributes: BTreeMap::new(),
            },
        );
        self
    }

    pub fn attribute(mut self, owner: &str, name: &str, kind: AttributeType) -> Self {
        if let Some(def) = self.classes.get_mut(owner) {
            def.attributes.insert(
                name.to_string(),
                AttributeDef {
                    name: name.to_string(),
                    owner: owner.to_string(),
                    kind,
                },
            );
        } else {
            tracing::warn!("Attribute '{}' declared on unknown class '{}'", name, owner);
        }
        self
    }

    pub fn build(self) -> AdapterResult<ClassHierarchy> {
        let mut children: HashMap<ClassRef, BTreeSet<ClassRef>> = HashMap::new();
        for (name, def) in &self.classes {
            if let Some(parent) = &def.extends {
                if !self.classes.contains_key(parent) {
                    return Err(AdapterError::ClassNotFound(parent.clone()));
                }
                children.entry(parent.clone()).or_default().insert(name.clone());
            }
        }
        for name in self.classes.keys() {
            let mut seen = BTreeSet::new();
            let mut next = Some(name);
            while let Some(current) = next {
                if !seen.insert(current) {
                    return Err(AdapterError::Config(format!(
                        "class '{}' is its own ancestor",
                        name
                    )));
                }
                next = self.classes.get(current).and_then(|def| def.extends.as_ref());
            }
        }
        Ok(ClassHierarchy {
            classes: self.classes,
            children,
        })
    }
}
