//! `parley ingest` — Add documents from a JSON file to the retrieval index.
//!
//! The file holds a JSON array. Each element is either a plain document
//! (`{"id"?, "text", "metadata"?}`) or a dog listing
//! (`{"id", "name", "description"}`), which is indexed as
//! `id: …, name: …, description: …`.

use super::services;
use parley_config::AppConfig;
use parley_core::retrieval::Document;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Record {
    Plain {
        #[serde(default)]
        id: Option<RecordId>,
        text: String,
        #[serde(default)]
        metadata: serde_json::Map<String, serde_json::Value>,
    },
    Dog {
        id: RecordId,
        name: String,
        description: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RecordId {
    Number(i64),
    Text(String),
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl Record {
    fn into_document(self) -> Document {
        match self {
            Self::Plain { id, text, metadata } => {
                let mut doc = Document::new(id.map(|id| id.to_string()).unwrap_or_default(), text);
                doc.metadata = metadata;
                doc
            }
            Self::Dog { id, name, description } => {
                let text = format!("id: {id}, name: {name}, description: {description}");
                Document::new(format!("dog-{id}"), text).with_metadata("name", serde_json::Value::String(name))
            }
        }
    }
}

fn parse_records(json: &str) -> Result<Vec<Document>, serde_json::Error> {
    let records: Vec<Record> = serde_json::from_str(json)?;
    Ok(records.into_iter().map(Record::into_document).collect())
}

pub async fn run(config: &AppConfig, file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(file)
        .map_err(|e| format!("Failed to read {}: {e}", file.display()))?;
    let documents = parse_records(&content).map_err(|e| format!("Failed to parse {}: {e}", file.display()))?;
    if documents.is_empty() {
        println!("No documents in {}", file.display());
        return Ok(());
    }

    let provider = parley_providers::build_from_config(config)?;
    let index = services::open_index(config, provider).await?;
    let ids = index.add(documents).await?;

    println!("Indexed {} document(s); index now holds {}", ids.len(), index.count().await?);
    Ok(())
}
