//! `ragline documents` / `ragline show` / `ragline delete`.

use anyhow::Result;

use crate::processor::DocumentProcessor;

pub async fn run_documents(
    processor: &DocumentProcessor,
    owner: Option<&str>,
    include_deleted: bool,
) -> Result<()> {
    let documents: Vec<_> = processor
        .list_documents(owner)
        .await?
        .into_iter()
        .filter(|d| include_deleted || !d.deleted)
        .collect();

    if documents.is_empty() {
        println!("No documents.");
        return Ok(());
    }

    for doc in &documents {
        let marker = if doc.deleted { " (deleted)" } else { "" };
        println!(
            "{}  {:<10}  gen {}  {:>4} chunks  {}{}",
            doc.id,
            doc.status.as_str(),
            doc.generation,
            doc.chunk_count,
            doc.title,
            marker
        );
        if let Some(err) = &doc.error {
            println!("    error: {err}");
        }
    }
    println!();
    println!("{} document(s)", documents.len());
    Ok(())
}

/// Full document record as JSON.
pub async fn run_show(processor: &DocumentProcessor, document_id: &str) -> Result<()> {
    let doc = processor.get_document(document_id).await?;
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

pub async fn run_delete(processor: &DocumentProcessor, document_id: &str) -> Result<()> {
    let removed = processor.delete_document(document_id).await?;
    println!("Deleted {document_id} ({removed} chunk records removed).");
    Ok(())
}
