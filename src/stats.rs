//! `ragline stats`: what is indexed.

use anyhow::Result;
use serde::Serialize;

use crate::config::Config;
use crate::registry::Components;

#[derive(Debug, Serialize)]
pub struct Stats {
    pub database: String,
    pub size_bytes: u64,
    pub backend: &'static str,
    pub collection: String,
    pub dimension: usize,
    pub chunks: usize,
    pub documents: usize,
    pub documents_by_status: std::collections::BTreeMap<String, usize>,
    pub in_flight_tasks: usize,
}

pub async fn collect_stats(components: &Components, config: &Config) -> Result<Stats> {
    let collection = components.processor.collection_stats().await?;
    let documents = components.processor.list_documents(None).await?;

    let mut by_status = std::collections::BTreeMap::new();
    for doc in documents.iter().filter(|d| !d.deleted) {
        *by_status.entry(doc.status.as_str().to_string()).or_insert(0) += 1;
    }

    Ok(Stats {
        database: config.db.path.display().to_string(),
        size_bytes: std::fs::metadata(&config.db.path)
            .map(|m| m.len())
            .unwrap_or(0),
        backend: components.store.backend(),
        collection: collection.collection,
        dimension: collection.dimension,
        chunks: collection.count,
        documents: by_status.values().sum(),
        documents_by_status: by_status,
        in_flight_tasks: components.processor.list_tasks().len(),
    })
}

pub async fn run_stats(components: &Components, config: &Config) -> Result<()> {
    let stats = collect_stats(components, config).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
