//! Bulk export of one content type as CSV or JSON.
//!
//! CSV needs the type's `csv_fields` capability; the header row is that
//! field list and each cell is the record's JSON value for the field
//! (strings verbatim, arrays and objects as JSON text, missing as empty).
//! Records are read newest first, a page at a time.

use std::path::Path;

use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::repository::{Order, QueryOptions, Repository};

const PAGE_SIZE: i64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Json => "application/json",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

/// `export-<Type>-<unix>.<ext>`
pub fn export_file_name(type_name: &str, format: ExportFormat) -> String {
    format!(
        "export-{}-{}.{}",
        type_name,
        chrono::Utc::now().timestamp(),
        format.extension()
    )
}

pub async fn export(repo: &Repository, type_name: &str, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Csv => export_csv(repo, type_name).await,
        ExportFormat::Json => export_json(repo, type_name).await,
    }
}

/// CSV text for every record of `type_name`. An empty type yields just
/// the header row.
pub async fn export_csv(repo: &Repository, type_name: &str) -> Result<String> {
    let ty = repo.entity_type(type_name)?;
    let fields = ty.new_record().csv_fields().ok_or_else(|| {
        EngineError::Unsupported(format!("'{}' does not support CSV export", type_name))
    })?;

    let mut out = String::new();
    write_row(&mut out, fields.iter().map(|f| f.as_str()));

    for record in all_records(repo, type_name).await? {
        let cells: Vec<String> = fields.iter().map(|f| cell(record.get(f))).collect();
        write_row(&mut out, cells.iter().map(|c| c.as_str()));
    }
    Ok(out)
}

/// Pretty JSON array of every record of `type_name`.
pub async fn export_json(repo: &Repository, type_name: &str) -> Result<String> {
    repo.entity_type(type_name)?;
    let records = all_records(repo, type_name).await?;
    Ok(serde_json::to_string_pretty(&records)?)
}

/// Writes an export to `output`, or to stdout when `None`.
pub async fn run_export(
    repo: &Repository,
    type_name: &str,
    format: ExportFormat,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let text = export(repo, type_name, format).await?;

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &text)?;
            eprintln!("Exported {} to {}", type_name, path.display());
        }
        None => {
            print!("{}", text);
        }
    }
    Ok(())
}

async fn all_records(repo: &Repository, type_name: &str) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    let mut page = 0;
    loop {
        let opts = QueryOptions {
            count: PAGE_SIZE,
            offset: page,
            order: Order::Desc,
        };
        let (total, records) = repo.query(type_name, opts).await?;
        if records.is_empty() {
            break;
        }
        for record in &records {
            out.push(record.to_json()?);
        }
        if out.len() as u64 >= total {
            break;
        }
        page += 1;
    }
    Ok(out)
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn write_row<'a>(out: &mut String, cells: impl Iterator<Item = &'a str>) {
    for (i, c) in cells.enumerate() {
        if i > 0 {
            out.push(',');
        }
        if c.contains(|ch: char| matches!(ch, ',' | '"' | '\n' | '\r')) {
            out.push('"');
            out.push_str(&c.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(c);
        }
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::{Review, Song};
    use crate::kv::KvStore;
    use crate::search::SearchIndexes;
    use crate::settings::ConfigCache;
    use content_engine_core::Registry;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn repo() -> (TempDir, Repository) {
        let tmp = TempDir::new().unwrap();
        let kv = KvStore::open(&tmp.path().join("system.db")).await.unwrap();
        let mut registry = Registry::new();
        crate::demo::register(&mut registry).unwrap();
        let registry = Arc::new(registry);
        let search = SearchIndexes::new(&tmp.path().join("search"), registry.clone());
        let config = ConfigCache::load(kv.clone()).await.unwrap();
        let repo = Repository::new(kv, registry, search, config, Duration::from_millis(10));
        for name in ["Review", "Song"] {
            repo.create_entity_store(name).await.unwrap();
        }
        (tmp, repo)
    }

    #[test]
    fn test_write_row_quotes() {
        let mut out = String::new();
        write_row(&mut out, ["plain", "a,b", "say \"hi\""].into_iter());
        assert_eq!(out, "plain,\"a,b\",\"say \"\"hi\"\"\"\n");
    }

    #[tokio::test]
    async fn test_csv_export() {
        let (_tmp, repo) = repo().await;
        for (title, rating) in [("One, Two", 3), ("Three", 5)] {
            let mut r = Review {
                title: title.into(),
                rating,
                tags: vec!["x".into(), "y".into()],
                ..Default::default()
            };
            repo.set_entity("Review", &mut r).await.unwrap();
        }

        let csv = export_csv(&repo, "Review").await.unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "id,title,rating,tags");
        assert_eq!(lines.len(), 3);
        // newest first, keys in descending order
        assert_eq!(lines[1], "2,Three,5,\"[\"\"x\"\",\"\"y\"\"]\"");
        assert_eq!(lines[2], "1,\"One, Two\",3,\"[\"\"x\"\",\"\"y\"\"]\"");
    }

    #[tokio::test]
    async fn test_csv_requires_capability() {
        let (_tmp, repo) = repo().await;
        let err = export_csv(&repo, "Song").await.unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_json_export_spans_pages() {
        let (_tmp, repo) = repo().await;
        for i in 0..(PAGE_SIZE + 3) {
            let mut s = Song {
                title: format!("Song {}", i),
                ..Default::default()
            };
            repo.set_entity("Song", &mut s).await.unwrap();
        }
        let json = export_json(&repo, "Song").await.unwrap();
        let parsed: Vec<Value> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), (PAGE_SIZE + 3) as usize);
    }

    #[test]
    fn test_export_file_name() {
        let name = export_file_name("Review", ExportFormat::Csv);
        assert!(name.starts_with("export-Review-"));
        assert!(name.ends_with(".csv"));
    }
}
