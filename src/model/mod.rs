pub mod document;
pub mod hierarchy;

pub use document::{ClassRef, DocId, Document, Domain};
pub use hierarchy::{
    AttributeDef, AttributeType, ClassHierarchy, ClassHierarchyBuilder, Hierarchy, ModelLookup,
    ResolvedAttribute, DOC_CLASS, MODEL_DOMAIN,
};
