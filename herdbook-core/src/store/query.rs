//! Selectors for `find` and live queries.

use serde_json::Value;

use crate::document::LocalDocument;

/// A document selector: field equality filters over the payload.
///
/// Tombstones are excluded unless `with_deleted` is set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    filters: Vec<(String, Value)>,
    include_deleted: bool,
    limit: Option<usize>,
}

impl Query {
    /// Matches every live document in the collection.
    pub fn all() -> Self {
        Self::default()
    }

    /// Adds an equality filter. Dotted fields address nested objects
    /// (`"dam.tag"` reads `data.dam.tag`).
    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    pub fn with_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn includes_deleted(&self) -> bool {
        self.include_deleted
    }

    /// Returns true if `doc` belongs to this query's result set.
    pub fn matches(&self, doc: &LocalDocument) -> bool {
        if doc.deleted && !self.include_deleted {
            return false;
        }
        self.filters.iter().all(|(field, expected)| {
            let pointer = format!("/{}", field.replace('.', "/"));
            doc.data.pointer(&pointer) == Some(expected)
        })
    }

    /// Filters and truncates an already ordered document list.
    pub(crate) fn apply(&self, docs: Vec<LocalDocument>) -> Vec<LocalDocument> {
        let matched = docs.into_iter().filter(|doc| self.matches(doc));
        match self.limit {
            Some(limit) => matched.take(limit).collect(),
            None => matched.collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, data: Value, deleted: bool) -> LocalDocument {
        let mut doc = LocalDocument::new(id, data);
        doc.deleted = deleted;
        doc
    }

    #[test]
    fn test_all_excludes_tombstones() {
        let query = Query::all();
        assert!(query.matches(&doc("a", json!({}), false)));
        assert!(!query.matches(&doc("b", json!({}), true)));
        assert!(Query::all().with_deleted().matches(&doc("b", json!({}), true)));
    }

    #[test]
    fn test_where_eq_nested_field() {
        let query = Query::all().where_eq("dam.tag", "A-12");
        assert!(query.matches(&doc("a", json!({"dam": {"tag": "A-12"}}), false)));
        assert!(!query.matches(&doc("b", json!({"dam": {"tag": "B-3"}}), false)));
        assert!(!query.matches(&doc("c", json!({"sex": "F"}), false)));
    }

    #[test]
    fn test_apply_respects_limit() {
        let docs = vec![
            doc("a", json!({"sex": "F"}), false),
            doc("b", json!({"sex": "M"}), false),
            doc("c", json!({"sex": "F"}), false),
            doc("d", json!({"sex": "F"}), false),
        ];
        let result = Query::all().where_eq("sex", "F").limit(2).apply(docs);
        let ids: Vec<&str> = result.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }
}
