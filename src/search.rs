//! Full-text search indexes, one per indexable content type.
//!
//! Each index lives in `<search_dir>/<Type>.index/` as its own SQLite file
//! holding an FTS5 table:
//!
//! ```text
//! docs(doc_id UNINDEXED, type, <field>, <field>, ...)
//! mapping(field, position)
//! ```
//!
//! The column list comes from the type's searchable fields at creation
//! time and is persisted in `mapping`, so an index opened later keeps the
//! schema it was built with. Document ids are `Type:id`.
//!
//! Query strings use the bleve-style syntax implemented in
//! [`content_engine_core::query`] and are always scoped to the index's type.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use content_engine_core::entity::FieldKind;
use content_engine_core::query::Query;
use content_engine_core::Registry;

use crate::error::{EngineError, Result};

const INDEX_SUFFIX: &str = ".index";
const RESERVED_COLUMNS: &[&str] = &["doc_id", "type", "rank", "docs", "rowid"];

/// Registry of open indexes keyed by type name. Cheap to clone.
#[derive(Clone)]
pub struct SearchIndexes {
    dir: PathBuf,
    registry: Arc<Registry>,
    indexes: Arc<RwLock<HashMap<String, Arc<TypeIndex>>>>,
}

impl SearchIndexes {
    pub fn new(dir: &Path, registry: Arc<Registry>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            registry,
            indexes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn index_dir(&self, type_name: &str) -> PathBuf {
        self.dir.join(format!("{}{}", type_name, INDEX_SUFFIX))
    }

    /// Binds every `<Type>.index` directory whose type is registered and
    /// indexable. Unknown directories are skipped.
    pub async fn open_existing(&self) -> Result<usize> {
        std::fs::create_dir_all(&self.dir)?;
        let mut opened = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(type_name) = name.strip_suffix(INDEX_SUFFIX) else {
                continue;
            };
            let indexable = self
                .registry
                .get(type_name)
                .map(|t| t.index_content())
                .unwrap_or(false);
            if !indexable {
                tracing::debug!(dir = %name, "skipping search directory for unknown type");
                continue;
            }
            self.create_index(type_name).await?;
            opened += 1;
        }
        Ok(opened)
    }

    /// Binds the index for `type_name`, creating it on disk if needed.
    ///
    /// Returns `false` for types that don't opt into indexing.
    pub async fn create_index(&self, type_name: &str) -> Result<bool> {
        let ty = self
            .registry
            .get(type_name)
            .ok_or_else(|| EngineError::unregistered(type_name))?;
        if !ty.index_content() {
            return Ok(false);
        }
        if self.indexes.read().contains_key(type_name) {
            return Ok(true);
        }

        let fields = mapping_for(type_name, &ty.searchable_fields())?;
        let index = TypeIndex::open(&self.index_dir(type_name), type_name, fields).await?;

        let mut indexes = self.indexes.write();
        if !indexes.contains_key(type_name) {
            tracing::info!(type_name, "search index ready");
            indexes.insert(type_name.to_string(), Arc::new(index));
        }
        Ok(true)
    }

    /// Drops the index for `type_name` and creates an empty one in its
    /// place. Callers re-index afterwards.
    pub async fn rebuild_index(&self, type_name: &str) -> Result<Option<Arc<TypeIndex>>> {
        let old = self.indexes.write().remove(type_name);
        if let Some(old) = old {
            old.close().await;
        }
        let dir = self.index_dir(type_name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        if self.create_index(type_name).await? {
            Ok(Some(self.get_index(type_name)?))
        } else {
            Ok(None)
        }
    }

    pub fn get_index(&self, type_name: &str) -> Result<Arc<TypeIndex>> {
        self.indexes
            .read()
            .get(type_name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("no search index for type '{}'", type_name)))
    }

    /// Bound index, if any. Used on write paths where a missing index is
    /// not an error.
    pub fn find_index(&self, type_name: &str) -> Option<Arc<TypeIndex>> {
        self.indexes.read().get(type_name).cloned()
    }

    /// Names of all bound indexes, sorted.
    pub fn indexes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexes.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn close(&self) {
        let all: Vec<Arc<TypeIndex>> = self.indexes.read().values().cloned().collect();
        for index in all {
            index.close().await;
        }
    }
}

fn mapping_for(type_name: &str, fields: &[(&str, FieldKind)]) -> Result<Vec<String>> {
    let mut columns = Vec::with_capacity(fields.len());
    for (name, kind) in fields {
        if !matches!(kind, FieldKind::Text | FieldKind::TextList) {
            return Err(EngineError::Programming(format!(
                "{}.{} is searchable but not a text field ({:?})",
                type_name, name, kind
            )));
        }
        let valid = name
            .chars()
            .next()
            .map(|c| c.is_ascii_lowercase() || c == '_')
            .unwrap_or(false)
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid || RESERVED_COLUMNS.contains(name) {
            return Err(EngineError::Programming(format!(
                "{}.{} can't be used as a search field name",
                type_name, name
            )));
        }
        columns.push(name.to_string());
    }
    Ok(columns)
}

// ============ Per-type index ============

/// One open full-text index.
#[derive(Debug)]
pub struct TypeIndex {
    type_name: String,
    fields: Vec<String>,
    pool: SqlitePool,
}

impl TypeIndex {
    async fn open(dir: &Path, type_name: &str, declared: Vec<String>) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("index.db");
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS mapping (field TEXT PRIMARY KEY, position INTEGER NOT NULL)",
        )
        .execute(&pool)
        .await?;

        let stored: Vec<String> = sqlx::query_scalar("SELECT field FROM mapping ORDER BY position")
            .fetch_all(&pool)
            .await?;

        let fields = if stored.is_empty() {
            for (i, f) in declared.iter().enumerate() {
                sqlx::query("INSERT INTO mapping (field, position) VALUES (?, ?)")
                    .bind(f.as_str())
                    .bind(i as i64)
                    .execute(&pool)
                    .await?;
            }
            declared
        } else {
            if stored != declared {
                tracing::warn!(
                    type_name,
                    "search fields changed since the index was built; run reindex to apply"
                );
            }
            stored
        };

        // FTS5 CREATE is not idempotent natively, so we check first
        let fts_exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='docs'",
        )
        .fetch_one(&pool)
        .await?;

        if !fts_exists {
            let mut columns = vec!["doc_id UNINDEXED".to_string(), "type".to_string()];
            columns.extend(fields.iter().cloned());
            let sql = format!("CREATE VIRTUAL TABLE docs USING fts5({})", columns.join(", "));
            sqlx::query(&sql).execute(&pool).await?;
        }

        Ok(Self {
            type_name: type_name.to_string(),
            fields,
            pool,
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Indexes (or re-indexes) one record under `doc_id`.
    pub async fn update(&self, doc_id: &str, record: &Value) -> Result<()> {
        let values: Vec<String> = self
            .fields
            .iter()
            .map(|f| stringify(record.get(f)))
            .collect();

        let placeholders = vec!["?"; self.fields.len() + 2].join(", ");
        let mut columns = vec!["doc_id", "type"];
        columns.extend(self.fields.iter().map(|f| f.as_str()));
        let sql = format!(
            "INSERT INTO docs ({}) VALUES ({})",
            columns.join(", "),
            placeholders
        );

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM docs WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;

        let mut insert = sqlx::query(&sql).bind(doc_id).bind(self.type_name.as_str());
        for v in &values {
            insert = insert.bind(v.as_str());
        }
        insert.execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete(&self, doc_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM docs WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Document ids matching `query`, best first. Skips `offset` hits and
    /// returns at most `count`.
    pub async fn search(&self, query: &str, count: i64, offset: i64) -> Result<Vec<String>> {
        let fields: Vec<&str> = self.fields.iter().map(|f| f.as_str()).collect();
        let expr = Query::parse(query)?.to_fts(&self.type_name, &fields)?;

        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT doc_id FROM docs
            WHERE docs MATCH ?
            ORDER BY rank
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(expr.as_str())
        .bind(count)
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn contains(&self, doc_id: &str) -> Result<bool> {
        let found: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM docs WHERE doc_id = ?")
            .bind(doc_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(found)
    }

    pub async fn doc_ids(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT doc_id FROM docs ORDER BY doc_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Text for one field; empty for missing or zero values.
fn stringify(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| stringify(Some(v)))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use content_engine_core::entity::{Entity, FieldSpec, Record};
    use content_engine_core::Item;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(default)]
    struct Article {
        #[serde(flatten)]
        item: Item,
        title: String,
        body: String,
    }

    impl Record for Article {
        fn item(&self) -> &Item {
            &self.item
        }
        fn item_mut(&mut self) -> &mut Item {
            &mut self.item
        }
    }

    impl Entity for Article {
        fn fields() -> Vec<FieldSpec> {
            vec![
                FieldSpec::text("title").searchable(),
                FieldSpec::text("body").searchable(),
            ]
        }
        fn index_content() -> bool {
            true
        }
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(default)]
    struct Counter {
        #[serde(flatten)]
        item: Item,
        hits: i64,
    }

    impl Record for Counter {
        fn item(&self) -> &Item {
            &self.item
        }
        fn item_mut(&mut self) -> &mut Item {
            &mut self.item
        }
    }

    impl Entity for Counter {
        fn fields() -> Vec<FieldSpec> {
            vec![FieldSpec::new("hits", FieldKind::Integer).searchable()]
        }
        fn index_content() -> bool {
            true
        }
    }

    fn indexes(tmp: &TempDir) -> SearchIndexes {
        let mut registry = Registry::new();
        registry.register::<Article>("Article").unwrap();
        registry.register::<Counter>("Counter").unwrap();
        SearchIndexes::new(&tmp.path().join("search"), Arc::new(registry))
    }

    #[tokio::test]
    async fn test_update_search_delete() {
        let tmp = TempDir::new().unwrap();
        let idx = indexes(&tmp);
        assert!(idx.create_index("Article").await.unwrap());
        let index = idx.get_index("Article").unwrap();

        index
            .update(
                "Article:1",
                &serde_json::json!({"title": "Hello", "body": "World"}),
            )
            .await
            .unwrap();
        index
            .update(
                "Article:2",
                &serde_json::json!({"title": "Other", "body": "things"}),
            )
            .await
            .unwrap();

        assert_eq!(index.search("world", 10, 0).await.unwrap(), vec!["Article:1"]);
        assert_eq!(
            index.search("title:other", 10, 0).await.unwrap(),
            vec!["Article:2"]
        );
        assert!(index.search("nothing", 10, 0).await.unwrap().is_empty());

        index.delete("Article:1").await.unwrap();
        assert!(!index.contains("Article:1").await.unwrap());
        assert!(index.search("world", 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_replaces_document() {
        let tmp = TempDir::new().unwrap();
        let idx = indexes(&tmp);
        idx.create_index("Article").await.unwrap();
        let index = idx.get_index("Article").unwrap();
        index
            .update("Article:1", &serde_json::json!({"title": "old"}))
            .await
            .unwrap();
        index
            .update("Article:1", &serde_json::json!({"title": "new"}))
            .await
            .unwrap();
        assert_eq!(index.doc_ids().await.unwrap(), vec!["Article:1"]);
        assert!(index.search("old", 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_text_searchable_field_is_programming_error() {
        let tmp = TempDir::new().unwrap();
        let idx = indexes(&tmp);
        let err = idx.create_index("Counter").await.unwrap_err();
        assert!(matches!(err, EngineError::Programming(_)));
    }

    #[tokio::test]
    async fn test_missing_index_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let idx = indexes(&tmp);
        assert!(idx.get_index("Article").unwrap_err().is_not_found());
        assert!(!idx.create_index("FileUpload").await.unwrap());
    }

    #[tokio::test]
    async fn test_open_existing_rebinds_directories() {
        let tmp = TempDir::new().unwrap();
        {
            let idx = indexes(&tmp);
            idx.create_index("Article").await.unwrap();
            idx.get_index("Article")
                .unwrap()
                .update("Article:5", &serde_json::json!({"title": "kept"}))
                .await
                .unwrap();
            idx.close().await;
        }
        std::fs::create_dir_all(tmp.path().join("search/Unknown.index")).unwrap();

        let idx = indexes(&tmp);
        assert_eq!(idx.open_existing().await.unwrap(), 1);
        assert_eq!(idx.indexes(), vec!["Article"]);
        let hits = idx.get_index("Article").unwrap().search("kept", 10, 0).await.unwrap();
        assert_eq!(hits, vec!["Article:5"]);
    }

    #[tokio::test]
    async fn test_rebuild_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let idx = indexes(&tmp);
        idx.create_index("Article").await.unwrap();
        idx.get_index("Article")
            .unwrap()
            .update("Article:1", &serde_json::json!({"title": "gone"}))
            .await
            .unwrap();
        let fresh = idx.rebuild_index("Article").await.unwrap().unwrap();
        assert!(fresh.doc_ids().await.unwrap().is_empty());
    }

    #[test]
    fn test_stringify() {
        assert_eq!(stringify(Some(&serde_json::json!(["a", "", "b"]))), "a b");
        assert_eq!(stringify(Some(&serde_json::json!(3))), "3");
        assert_eq!(stringify(None), "");
    }
}
