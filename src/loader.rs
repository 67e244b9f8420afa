//! Document loaders.
//!
//! A [`DocumentSource`] says where text comes from; a [`DocumentLoader`]
//! turns it into a [`LoadedDocument`]. The [`LoaderRegistry`] picks the
//! first registered loader that supports a source.
//!
//! | Loader | Source | Formats |
//! |--------|--------|---------|
//! | [`TextLoader`] | inline text | any |
//! | [`FileLoader`] | local path | `.pdf`, `.html`/`.htm`, any UTF-8 text |
//! | [`UrlLoader`] | `http(s)://` | HTML pages, PDF, plain text |

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ragline_core::error::{RagError, Result};
use ragline_core::models::SourceType;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::IngestConfig;
use crate::extract;
use crate::retry::{classify_reqwest, classify_status, with_retry, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DocumentSource {
    Text { text: String, title: Option<String> },
    File { path: PathBuf },
    Url { url: String },
}

impl DocumentSource {
    pub fn text(text: impl Into<String>, title: Option<String>) -> Self {
        DocumentSource::Text {
            text: text.into(),
            title,
        }
    }

    /// Short human-readable label for logs.
    pub fn describe(&self) -> String {
        match self {
            DocumentSource::Text { title, text } => match title {
                Some(t) => format!("text '{t}'"),
                None => format!("text ({} bytes)", text.len()),
            },
            DocumentSource::File { path } => path.display().to_string(),
            DocumentSource::Url { url } => url.clone(),
        }
    }
}

/// `http://` and `https://` inputs are URLs, anything else a file path.
pub fn detect_source(input: &str) -> DocumentSource {
    let lower = input.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        DocumentSource::Url {
            url: input.to_string(),
        }
    } else {
        DocumentSource::File {
            path: PathBuf::from(input),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedDocument {
    pub title: String,
    pub source_type: SourceType,
    pub text: String,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait DocumentLoader: Send + Sync {
    fn kind(&self) -> &'static str;

    fn supports(&self, source: &DocumentSource) -> bool;

    async fn load(&self, source: &DocumentSource) -> Result<LoadedDocument>;
}

fn unsupported(loader: &str, source: &DocumentSource) -> RagError {
    RagError::validation(format!(
        "{loader} loader cannot load {}",
        source.describe()
    ))
}

// ============ Inline text ============

pub struct TextLoader;

#[async_trait]
impl DocumentLoader for TextLoader {
    fn kind(&self) -> &'static str {
        "text"
    }

    fn supports(&self, source: &DocumentSource) -> bool {
        matches!(source, DocumentSource::Text { .. })
    }

    async fn load(&self, source: &DocumentSource) -> Result<LoadedDocument> {
        let DocumentSource::Text { text, title } = source else {
            return Err(unsupported(self.kind(), source));
        };
        Ok(LoadedDocument {
            title: title.clone().unwrap_or_else(|| "Untitled".to_string()),
            source_type: SourceType::Text,
            text: text.clone(),
            metadata: serde_json::json!({ "type": "text" }),
        })
    }
}

// ============ Local files ============

pub struct FileLoader;

#[async_trait]
impl DocumentLoader for FileLoader {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn supports(&self, source: &DocumentSource) -> bool {
        matches!(source, DocumentSource::File { .. })
    }

    async fn load(&self, source: &DocumentSource) -> Result<LoadedDocument> {
        let DocumentSource::File { path } = source else {
            return Err(unsupported(self.kind(), source));
        };
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|_| RagError::not_found("file", path.display().to_string()))?;
        if !meta.is_file() {
            return Err(RagError::validation(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| RagError::processing(format!("failed to read {}: {e}", path.display())))?;

        let (text, source_type, html_title) = match extension.as_str() {
            "pdf" => {
                let text = tokio::task::spawn_blocking(move || extract::extract_pdf(&bytes))
                    .await
                    .map_err(|e| RagError::processing(format!("PDF extraction panicked: {e}")))??;
                (text, SourceType::Pdf, None)
            }
            "html" | "htm" => {
                let html = utf8(bytes, path)?;
                (extract::html_to_text(&html), SourceType::Text, extract::html_title(&html))
            }
            _ => (utf8(bytes, path)?, SourceType::Text, None),
        };

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let modified = meta
            .modified()
            .ok()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339());

        Ok(LoadedDocument {
            title: html_title.unwrap_or_else(|| file_name.clone()),
            source_type,
            text,
            metadata: serde_json::json!({
                "type": "file",
                "source": path.display().to_string(),
                "file_name": file_name,
                "extension": extension,
                "size_bytes": meta.len(),
                "modified": modified,
            }),
        })
    }
}

fn utf8(bytes: Vec<u8>, path: &Path) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| {
        RagError::validation(format!(
            "unsupported file type: {} is not UTF-8 text",
            path.display()
        ))
    })
}

// ============ URLs ============

pub struct UrlLoader {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl UrlLoader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ragline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RagError::processing(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            retry: RetryPolicy::new(2, Duration::from_millis(500)),
        })
    }

    async fn fetch(&self, url: &reqwest::Url) -> Result<(Option<String>, Vec<u8>)> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| classify_reqwest("url", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("url", status, &body));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest("url", e))?;
        Ok((content_type, bytes.to_vec()))
    }
}

/// Reject anything that is not an absolute http(s) URL with a host.
fn parse_url(raw: &str) -> Result<reqwest::Url> {
    let url = reqwest::Url::parse(raw)
        .map_err(|e| RagError::validation(format!("invalid URL {raw}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(RagError::validation(format!("invalid URL: {raw}")));
    }
    Ok(url)
}

#[async_trait]
impl DocumentLoader for UrlLoader {
    fn kind(&self) -> &'static str {
        "url"
    }

    fn supports(&self, source: &DocumentSource) -> bool {
        matches!(source, DocumentSource::Url { .. })
    }

    async fn load(&self, source: &DocumentSource) -> Result<LoadedDocument> {
        let DocumentSource::Url { url: raw } = source else {
            return Err(unsupported(self.kind(), source));
        };
        let url = parse_url(raw)?;
        tracing::debug!(%url, "fetching");

        let (content_type, bytes) =
            with_retry(&self.retry, "url", None, || self.fetch(&url)).await?;
        let content_type = content_type.unwrap_or_default();

        let (text, page_title) = if content_type.contains("application/pdf") {
            let text = tokio::task::spawn_blocking(move || extract::extract_pdf(&bytes))
                .await
                .map_err(|e| RagError::processing(format!("PDF extraction panicked: {e}")))??;
            (text, None)
        } else {
            let body = String::from_utf8_lossy(&bytes).into_owned();
            if content_type.contains("html") || body.trim_start().starts_with('<') {
                (extract::html_to_text(&body), extract::html_title(&body))
            } else {
                (body, None)
            }
        };

        let host = url.host_str().unwrap_or_default().to_string();
        Ok(LoadedDocument {
            title: page_title.clone().unwrap_or_else(|| raw.clone()),
            source_type: SourceType::Url,
            text,
            metadata: serde_json::json!({
                "type": "url",
                "source": raw,
                "domain": host,
                "scheme": url.scheme(),
                "path": url.path(),
                "content_type": content_type,
                "title": page_title,
                "retrieval_date": chrono::Utc::now().to_rfc3339(),
            }),
        })
    }
}

// ============ Registry ============

/// Ordered loader list; the first loader whose `supports` matches wins.
#[derive(Clone, Default)]
pub struct LoaderRegistry {
    loaders: Vec<Arc<dyn DocumentLoader>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text, file and URL loaders.
    pub fn with_defaults(url_timeout: Duration) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(TextLoader));
        registry.register(Arc::new(FileLoader));
        registry.register(Arc::new(UrlLoader::new(url_timeout)?));
        Ok(registry)
    }

    pub fn register(&mut self, loader: Arc<dyn DocumentLoader>) {
        self.loaders.push(loader);
    }

    pub fn resolve(&self, source: &DocumentSource) -> Result<Arc<dyn DocumentLoader>> {
        self.loaders
            .iter()
            .find(|l| l.supports(source))
            .cloned()
            .ok_or_else(|| {
                RagError::validation(format!("no loader registered for {}", source.describe()))
            })
    }

    pub async fn load(&self, source: &DocumentSource) -> Result<LoadedDocument> {
        let loader = self.resolve(source)?;
        tracing::debug!(loader = loader.kind(), source = %source.describe(), "loading");
        loader.load(source).await
    }
}

// ============ Directory scanning ============

/// Files under `root` matching the include globs and none of the exclude
/// globs, sorted by path. VCS and build directories are always skipped.
pub fn scan_directory(root: &Path, ingest: &IngestConfig) -> anyhow::Result<Vec<PathBuf>> {
    if !root.is_dir() {
        bail!("not a directory: {}", root.display());
    }
    let include_set = build_globset(&ingest.include_globs)?;

    let mut excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    excludes.extend(ingest.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy();
        if exclude_set.is_match(rel_str.as_ref()) || !include_set.is_match(rel_str.as_ref()) {
            continue;
        }
        files.push(path.to_path_buf());
    }
    files.sort();
    Ok(files)
}

fn build_globset(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_detect_source() {
        assert!(matches!(
            detect_source("https://example.com/a"),
            DocumentSource::Url { .. }
        ));
        assert!(matches!(
            detect_source("HTTP://example.com"),
            DocumentSource::Url { .. }
        ));
        assert!(matches!(
            detect_source("./notes/visa.md"),
            DocumentSource::File { .. }
        ));
    }

    #[test]
    fn test_parse_url_rejects_non_http() {
        assert!(parse_url("ftp://example.com/x").is_err());
        assert!(parse_url("not a url").is_err());
        assert!(parse_url("https://example.com/x").is_ok());
    }

    #[tokio::test]
    async fn test_registry_resolves_by_source() {
        let registry = LoaderRegistry::with_defaults(Duration::from_secs(5)).unwrap();
        let text = DocumentSource::text("hello", Some("Greeting".into()));
        assert_eq!(registry.resolve(&text).unwrap().kind(), "text");
        assert_eq!(registry.resolve(&detect_source("a.txt")).unwrap().kind(), "file");
        assert_eq!(
            registry.resolve(&detect_source("https://example.com")).unwrap().kind(),
            "url"
        );

        let loaded = registry.load(&text).await.unwrap();
        assert_eq!(loaded.title, "Greeting");
        assert_eq!(loaded.source_type, SourceType::Text);
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let err = LoaderRegistry::new()
            .resolve(&DocumentSource::text("x", None))
            .err()
            .unwrap();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn test_file_loader_text_and_html() {
        let tmp = TempDir::new().unwrap();
        let md = tmp.path().join("visa.md");
        std::fs::write(&md, "# Visas\n\nApply early.").unwrap();
        let html = tmp.path().join("page.html");
        std::fs::write(&html, "<title>Page</title><p>Body text</p>").unwrap();

        let loaded = FileLoader
            .load(&DocumentSource::File { path: md })
            .await
            .unwrap();
        assert_eq!(loaded.title, "visa.md");
        assert_eq!(loaded.text, "# Visas\n\nApply early.");
        assert_eq!(loaded.metadata["extension"], "md");

        let loaded = FileLoader
            .load(&DocumentSource::File { path: html })
            .await
            .unwrap();
        assert_eq!(loaded.title, "Page");
        assert_eq!(loaded.text, "Page\nBody text");
    }

    #[tokio::test]
    async fn test_file_loader_errors() {
        let tmp = TempDir::new().unwrap();
        let missing = FileLoader
            .load(&DocumentSource::File {
                path: tmp.path().join("missing.txt"),
            })
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), "not_found");

        let bin = tmp.path().join("blob.bin");
        std::fs::write(&bin, [0xff, 0xfe, 0x00, 0x81]).unwrap();
        let err = FileLoader
            .load(&DocumentSource::File { path: bin })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_scan_directory_globs() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("docs/drafts")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join("docs/a.md"), "a").unwrap();
        std::fs::write(root.join("docs/b.txt"), "b").unwrap();
        std::fs::write(root.join("docs/drafts/c.md"), "c").unwrap();
        std::fs::write(root.join("docs/image.png"), "x").unwrap();
        std::fs::write(root.join(".git/HEAD.md"), "x").unwrap();

        let ingest = IngestConfig {
            exclude_globs: vec!["**/drafts/**".to_string()],
            ..IngestConfig::default()
        };
        let files = scan_directory(root, &ingest).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(names, vec!["docs/a.md", "docs/b.txt"]);
    }
}
