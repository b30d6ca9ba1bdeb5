//! Query execution over a [`NativeStore`].
//!
//! Queries without joins or computed sort fields run as a plain find (the
//! fast path); everything else compiles to an aggregation pipeline. Both
//! paths run under the read limiter, and every returned document has its
//! digest stripped.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::error::{truncate_for_log, AdapterError, AdapterResult};
use crate::limiter::RateLimiter;
use crate::model::document::{into_document, CLASS_FIELD, ID_FIELD};
use crate::model::{Document, Domain, Hierarchy, ModelLookup};
use crate::native::filter::{matches, project};
use crate::native::update::remove_path;
use crate::native::{NativeFindOptions, NativeStore};
use crate::query::filter::{compile_filter, CompiledFilter};
use crate::query::keys::translate_key;
use crate::query::lookup::{fill_lookups, plan_lookups, LookupStep};
use crate::query::sort::{needs_pipeline, plan_sort, strip_sort_fields};
use crate::query::{FindOptions, FindResult, LookupSpec};

pub struct QueryExecutor {
    store: Arc<dyn NativeStore>,
    hierarchy: Arc<dyn Hierarchy>,
    model: Option<Arc<dyn ModelLookup>>,
    limiter: RateLimiter,
    log_truncate: usize,
}

impl QueryExecutor {
    pub fn new(
        store: Arc<dyn NativeStore>,
        hierarchy: Arc<dyn Hierarchy>,
        model: Option<Arc<dyn ModelLookup>>,
        limiter: RateLimiter,
        log_truncate: usize,
    ) -> Self {
        Self {
            store,
            hierarchy,
            model,
            limiter,
            log_truncate,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Find documents of `class` matching `query`.
    pub async fn find_all(
        &self,
        class: &str,
        query: &Map<String, Value>,
        options: &FindOptions,
    ) -> AdapterResult<FindResult> {
        let domain = match &options.domain {
            Some(domain) => domain.clone(),
            None => self.hierarchy.domain(class)?,
        };
        let compiled = compile_filter(
            self.hierarchy.as_ref(),
            class,
            query,
            options.skip_class,
            options.skip_space,
        )?;

        let result = if self.use_pipeline(class, &compiled, options) {
            self.limiter
                .exec("find_all(pipeline)", &domain, async {
                    self.find_with_pipeline(class, &domain, &compiled, options).await
                })
                .await
        } else {
            self.limiter
                .exec("find_all", &domain, async {
                    self.find_direct(class, &domain, &compiled, options).await
                })
                .await
        };

        result.map_err(|e| self.query_error(class, &compiled, options, e))
    }

    /// Load documents of a domain by id. Missing ids are skipped.
    pub async fn load_by_ids(&self, domain: &str, ids: &[String]) -> AdapterResult<Vec<Document>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = json!({ ID_FIELD: { "$in": ids } });
        let rows = self
            .limiter
            .exec("load_by_ids", domain, async {
                Ok(self
                    .store
                    .find(domain, &filter, &NativeFindOptions::default())
                    .await?)
            })
            .await?;
        rows.into_iter().map(into_document).collect()
    }

    fn use_pipeline(&self, class: &str, compiled: &CompiledFilter, options: &FindOptions) -> bool {
        let has_lookup = options.lookup.as_ref().map(|l| !l.is_empty()).unwrap_or(false);
        if has_lookup || !compiled.lookup.is_empty() {
            return true;
        }
        // a point read by id returns at most one row, so ordering is moot
        let point = compiled.base.get(ID_FIELD).map(Value::is_string).unwrap_or(false);
        !point
            && options
                .sort
                .iter()
                .any(|(key, spec)| needs_pipeline(self.hierarchy.as_ref(), class, key, spec))
    }

    fn query_error(
        &self,
        class: &str,
        compiled: &CompiledFilter,
        options: &FindOptions,
        err: AdapterError,
    ) -> AdapterError {
        match err {
            AdapterError::Native(native) => {
                let filter = truncate_for_log(&compiled.merged().to_string(), self.log_truncate);
                let options = truncate_for_log(&format!("{:?}", options), self.log_truncate);
                tracing::error!(
                    "Query on {} failed: {} (filter: {}, options: {})",
                    class,
                    native,
                    filter,
                    options
                );
                AdapterError::Query {
                    class: class.to_string(),
                    filter,
                    message: native.to_string(),
                }
            }
            other => other,
        }
    }

    /// Stored paths a projection asked for, identity fields included
    fn requested_fields(&self, class: &str, options: &FindOptions) -> Vec<String> {
        let mut fields = vec![ID_FIELD.to_string(), CLASS_FIELD.to_string()];
        for field in options.projection.iter().flatten() {
            fields.push(translate_key(self.hierarchy.as_ref(), field, class, None).path);
        }
        fields
    }

    fn projection(&self, class: &str, options: &FindOptions, extra: &[String]) -> Option<Map<String, Value>> {
        options.projection.as_ref()?;
        let mut projection = Map::new();
        for path in self.requested_fields(class, options) {
            projection.insert(path, json!(1));
        }
        for alias in extra {
            projection.insert(alias.clone(), json!(1));
        }
        Some(projection)
    }

    async fn find_direct(
        &self,
        class: &str,
        domain: &Domain,
        compiled: &CompiledFilter,
        options: &FindOptions,
    ) -> AdapterResult<FindResult> {
        let filter = compiled.merged();
        let native_options = NativeFindOptions {
            sort: options
                .sort
                .iter()
                .map(|(key, spec)| {
                    let path = translate_key(self.hierarchy.as_ref(), key, class, None).path;
                    (path, spec.order())
                })
                .collect(),
            limit: options.limit,
            projection: None,
        };
        let projection = self.projection(class, options, &[]);

        let rows = if let Some(id) = compiled.base.get(ID_FIELD).filter(|v| v.is_string()) {
            // a point read by id bypasses the class filter, so re-check the row
            let point = json!({ ID_FIELD: id });
            match self
                .store
                .find_one(domain, &point, &NativeFindOptions::default())
                .await?
            {
                Some(row) if matches(&row, &filter)? => vec![row],
                _ => Vec::new(),
            }
        } else if options.limit == Some(1) {
            self.store
                .find_one(domain, &filter, &native_options)
                .await?
                .into_iter()
                .collect()
        } else {
            self.store.find(domain, &filter, &native_options).await?
        };

        let total = if options.total {
            match options.limit {
                None => Some(rows.len() as u64),
                Some(_) => Some(self.store.count(domain, &filter).await?),
            }
        } else {
            None
        };

        let documents = rows
            .into_iter()
            .map(|row| match &projection {
                Some(projection) => project(&row, projection),
                None => row,
            })
            .map(into_document)
            .collect::<AdapterResult<Vec<_>>>()?;
        Ok(FindResult { documents, total })
    }

    async fn find_with_pipeline(
        &self,
        class: &str,
        domain: &Domain,
        compiled: &CompiledFilter,
        options: &FindOptions,
    ) -> AdapterResult<FindResult> {
        let empty = LookupSpec::new();
        let lookup = options.lookup.as_ref().unwrap_or(&empty);
        let steps = plan_lookups(self.hierarchy.as_ref(), class, lookup)?;
        if !compiled.lookup.is_empty() && steps.is_empty() {
            return Err(AdapterError::InvalidQuery(
                "filter on joined fields requires a lookup".to_string(),
            ));
        }
        let sort = plan_sort(self.hierarchy.as_ref(), class, &options.sort)?;
        let lookup_stages: Vec<Value> = steps.iter().map(LookupStep::to_stage).collect();

        let mut prefix = vec![json!({ "$match": compiled.base })];
        let mut pipeline;
        if compiled.lookup.is_empty() && !sort.joined {
            // nothing reads joined data before the limit, so join only what is returned
            pipeline = prefix.clone();
            pipeline.extend(sort.stages());
            if let Some(limit) = options.limit {
                pipeline.push(json!({ "$limit": limit }));
            }
            pipeline.extend(lookup_stages.iter().cloned());
        } else {
            prefix.extend(lookup_stages.iter().cloned());
            if !compiled.lookup.is_empty() {
                prefix.push(json!({ "$match": compiled.lookup }));
            }
            pipeline = prefix.clone();
            pipeline.extend(sort.stages());
            if let Some(limit) = options.limit {
                pipeline.push(json!({ "$limit": limit }));
            }
        }
        // the fill pass reads forward references from the row itself
        let ref_fields: Vec<String> = lookup
            .forward
            .iter()
            .map(|(key, _)| translate_key(self.hierarchy.as_ref(), key, class, None).path)
            .collect();
        let mut extra: Vec<String> = steps.iter().map(|s| s.alias.clone()).collect();
        extra.extend(ref_fields.iter().cloned());
        let projection = self.projection(class, options, &extra);
        let unrequested: Vec<String> = match &projection {
            Some(_) => {
                let requested = self.requested_fields(class, options);
                ref_fields
                    .into_iter()
                    .filter(|f| !requested.contains(f))
                    .collect()
            }
            None => Vec::new(),
        };
        if let Some(projection) = projection {
            pipeline.push(json!({ "$project": projection }));
        }

        let logged = serde_json::Value::Array(pipeline.clone());
        tracing::debug!("Pipeline on {}: {}", domain, logged);
        let rows = self.store.aggregate(domain, &pipeline).await?;

        let total = if options.total {
            prefix.push(json!({ "$count": "total" }));
            let counted = self.store.aggregate(domain, &prefix).await?;
            Some(
                counted
                    .first()
                    .and_then(|row| row.get("total"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            )
        } else {
            None
        };

        let mut documents = Vec::with_capacity(rows.len());
        for mut row in rows {
            fill_lookups(
                self.hierarchy.as_ref(),
                self.model.as_deref(),
                class,
                lookup,
                &steps,
                &mut row,
            )?;
            strip_sort_fields(&mut row);
            for field in &unrequested {
                remove_path(&mut row, field);
            }
            documents.push(into_document(row)?);
        }
        Ok(FindResult { documents, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributeType, ClassHierarchy, DOC_CLASS};
    use crate::native::{MemoryStore, SortOrder};
    use crate::query::query_map;
    use std::time::Duration;

    fn setup() -> (Arc<MemoryStore>, QueryExecutor) {
        let hierarchy = ClassHierarchy::builder()
            .class("A", DOC_CLASS, Some("task"))
            .class("B", "A", None)
            .class("core:class:Space", DOC_CLASS, Some("space"))
            .attribute("A", "priority", AttributeType::Enum(vec!["low".into(), "high".into()]))
            .attribute("A", "space", AttributeType::Ref("core:class:Space".into()))
            .build()
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert_documents(
            "task",
            vec![
                json!({"_id": "1", "_class": "A", "space": "s1", "priority": "high", "n": 2, "%hash%": "x|1"}),
                json!({"_id": "2", "_class": "B", "space": "s2", "priority": "low", "n": 1}),
                json!({"_id": "3", "_class": "Other", "space": "s1", "n": 3}),
            ],
        );
        store.insert_documents(
            "space",
            vec![json!({"_id": "s1", "_class": "core:class:Space", "name": "One"})],
        );
        let executor = QueryExecutor::new(
            store.clone(),
            Arc::new(hierarchy),
            None,
            RateLimiter::new("read", 4, Duration::from_secs(1)),
            512,
        );
        (store, executor)
    }

    fn ids(result: &FindResult) -> Vec<&str> {
        result.documents.iter().map(|d| d.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_fast_path_scopes_and_sorts() {
        let (_, executor) = setup();
        let options = FindOptions::new().sort("n", SortOrder::Ascending).with_total();
        let result = executor.find_all("A", &Map::new(), &options).await.unwrap();
        assert_eq!(ids(&result), vec!["2", "1"]);
        assert_eq!(result.total, Some(2));
        assert!(result.documents.iter().all(|d| d.digest().is_none()));
    }

    #[tokio::test]
    async fn test_point_lookup_revalidates_class() {
        let (_, executor) = setup();
        let hit = executor
            .find_all("B", &query_map(json!({"_id": "2"})).unwrap(), &FindOptions::new())
            .await
            .unwrap();
        assert_eq!(ids(&hit), vec!["2"]);
        let miss = executor
            .find_all("B", &query_map(json!({"_id": "1"})).unwrap(), &FindOptions::new())
            .await
            .unwrap();
        assert!(miss.documents.is_empty());
    }

    #[tokio::test]
    async fn test_limit_total_uses_count() {
        let (_, executor) = setup();
        let options = FindOptions::new().limit(1).sort("n", SortOrder::Descending).with_total();
        let result = executor.find_all("A", &Map::new(), &options).await.unwrap();
        assert_eq!(ids(&result), vec!["1"]);
        assert_eq!(result.total, Some(2));
    }

    #[tokio::test]
    async fn test_enum_sort_goes_through_pipeline() {
        let (_, executor) = setup();
        let options = FindOptions::new().sort("priority", SortOrder::Descending);
        let result = executor.find_all("A", &Map::new(), &options).await.unwrap();
        assert_eq!(ids(&result), vec!["1", "2"]);
        assert!(result.documents[0].data.keys().all(|k| !k.starts_with("__sort_")));
    }

    #[tokio::test]
    async fn test_point_read_ignores_enum_sort() {
        let (_, executor) = setup();
        let options = FindOptions::new().sort("priority", SortOrder::Ascending);
        let query = query_map(json!({"_id": "1"})).unwrap();
        let compiled = compile_filter(executor.hierarchy.as_ref(), "A", &query, false, false).unwrap();
        assert!(!executor.use_pipeline("A", &compiled, &options));
        let result = executor
            .find_all("A", &query, &options)
            .await
            .unwrap();
        assert_eq!(ids(&result), vec!["1"]);
    }

    #[tokio::test]
    async fn test_lookup_filter_and_total() {
        let (_, executor) = setup();
        let options = FindOptions::new()
            .lookup(LookupSpec::new().forward("space", "core:class:Space"))
            .with_total();
        let query = query_map(json!({"$lookup.space.name": "One"})).unwrap();
        let result = executor.find_all("A", &query, &options).await.unwrap();
        assert_eq!(ids(&result), vec!["1"]);
        assert_eq!(result.total, Some(1));
        let lookup = result.documents[0].lookup().unwrap();
        assert_eq!(lookup["space"]["name"], "One");
        assert!(!result.documents[0].data.contains_key("space_lookup"));
    }

    #[tokio::test]
    async fn test_joined_filter_without_lookup_is_rejected() {
        let (_, executor) = setup();
        let query = query_map(json!({"$lookup.space.name": "One"})).unwrap();
        let err = executor.find_all("A", &query, &FindOptions::new()).await.unwrap_err();
        assert!(matches!(err, AdapterError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn test_native_failure_becomes_query_error() {
        let (_, executor) = setup();
        let query = query_map(json!({"n": {"$bogus": 1}})).unwrap();
        let err = executor.find_all("A", &query, &FindOptions::new()).await.unwrap_err();
        match err {
            AdapterError::Query { class, filter, .. } => {
                assert_eq!(class, "A");
                assert!(filter.contains("$bogus"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_projection_keeps_identity() {
        let (_, executor) = setup();
        let options = FindOptions::new().projection(&["n"]).sort("n", SortOrder::Ascending);
        let result = executor.find_all("A", &Map::new(), &options).await.unwrap();
        let doc = &result.documents[0];
        assert_eq!(doc.class, "B");
        assert_eq!(doc.data.get("n"), Some(&json!(1)));
        assert!(doc.data.get("priority").is_none());
    }

    #[tokio::test]
    async fn test_projection_keeps_joined_documents() {
        let (_, executor) = setup();
        let options = FindOptions::new()
            .lookup(LookupSpec::new().forward("space", "core:class:Space"))
            .projection(&["n"])
            .sort("n", SortOrder::Descending);
        let result = executor.find_all("A", &Map::new(), &options).await.unwrap();
        assert_eq!(ids(&result), vec!["1", "2"]);

        let first = &result.documents[0];
        assert_eq!(first.lookup().unwrap()["space"]["name"], "One");
        // the reference was only read to join, it was not asked for
        assert_eq!(first.space, "");
        assert!(first.data.get("priority").is_none());
        assert_eq!(first.data.get("n"), Some(&json!(2)));

        let kept = FindOptions::new()
            .lookup(LookupSpec::new().forward("space", "core:class:Space"))
            .projection(&["space"])
            .sort("n", SortOrder::Descending);
        let result = executor.find_all("A", &Map::new(), &kept).await.unwrap();
        assert_eq!(result.documents[0].space, "s1");
        assert_eq!(result.documents[0].lookup().unwrap()["space"]["name"], "One");
    }

    #[tokio::test]
    async fn test_load_by_ids() {
        let (_, executor) = setup();
        let docs = executor
            .load_by_ids("task", &["1".to_string(), "nope".to_string()])
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].digest().is_none());
    }
}
