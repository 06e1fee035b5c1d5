//! Portfolio retrieval.
//!
//! Wraps a similarity search over a [`VectorIndex`] and turns the hits into
//! the context string handed to the model, together with the
//! project-name → URL table used later to repair answers that drop links.
//!
//! The context string is the only channel through which URL information
//! reaches the model, so the header format produced by [`build_context`] is
//! also what [`parse_url_table`] reads back out of a tool result.

pub mod index;
pub mod tool;

pub use index::{Embedder, FastEmbedder, MemoryIndex, VectorIndex};
pub use tool::PortfolioSearchTool;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Heading line of the URL block at the top of the context.
pub const URL_HEADER: &str =
    "IMPORTANT - Project URLs (ALWAYS include these when mentioning these projects):";
/// Prefix of each `project: url` line in the URL block.
pub const URL_LINE_PREFIX: &str = "  • ";
/// Separates the URL block from the document contents.
pub const CONTEXT_HEADER: &str = "\nContext from documents:";
/// Precedes every hit's content.
pub const HIT_DELIMITER: &str = "\n---\n";

/// Document extensions stripped when deriving a project name from a file name.
pub const DOCUMENT_EXTENSIONS: &[&str] = &[".md", ".markdown", ".pdf", ".txt"];

/// One ranked result of a similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalHit {
    /// Chunk text.
    pub content: String,
    /// Scalar-or-null metadata attached at ingestion time.
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl RetrievalHit {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Project name: `name` if set, otherwise `file_name` minus its document
    /// extension. Empty when neither is usable.
    pub fn project_name(&self) -> String {
        if let Some(name) = self.metadata_str("name").filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        self.metadata_str("file_name")
            .map(|f| strip_document_extension(f).to_string())
            .unwrap_or_default()
    }

    /// The hit's live URL, if it carries a real one.
    ///
    /// Null, non-string, blank and the literal `"null"` (any case) are all
    /// treated as absent; ingestion leaves such sentinels behind.
    pub fn live_url(&self) -> Option<&str> {
        let url = self.metadata_str("live_url")?;
        let trimmed = url.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
            return None;
        }
        Some(url)
    }
}

/// Strip one trailing document extension (case-insensitive).
pub fn strip_document_extension(name: &str) -> &str {
    for ext in DOCUMENT_EXTENSIONS {
        if name.len() > ext.len() {
            let split = name.len() - ext.len();
            if name.is_char_boundary(split) && name[split..].eq_ignore_ascii_case(ext) {
                return &name[..split];
            }
        }
    }
    name
}

/// Ordered project-name → URL mapping.
///
/// Keys are case-preserving but compared case-insensitively: inserting a key
/// that differs only in case replaces the URL in place, keeping the first-seen
/// spelling and position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectUrlTable {
    entries: Vec<(String, String)>,
}

impl ProjectUrlTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, project: impl Into<String>, url: impl Into<String>) {
        let project = project.into();
        let url = url.into();
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(p, _)| same_project(p, &project))
        {
            entry.1 = url;
        } else {
            self.entries.push((project, url));
        }
    }

    pub fn get(&self, project: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(p, _)| same_project(p, project))
            .map(|(_, u)| u.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(p, u)| (p.as_str(), u.as_str()))
    }
}

fn same_project(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b) || a.to_lowercase() == b.to_lowercase()
}

impl<P: Into<String>, U: Into<String>> FromIterator<(P, U)> for ProjectUrlTable {
    fn from_iter<I: IntoIterator<Item = (P, U)>>(iter: I) -> Self {
        let mut table = Self::new();
        for (p, u) in iter {
            table.insert(p, u);
        }
        table
    }
}

impl Serialize for ProjectUrlTable {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (p, u) in &self.entries {
            map.serialize_entry(p, u)?;
        }
        map.end()
    }
}

/// URL table for a set of hits, in hit order.
pub fn extract_url_table(hits: &[RetrievalHit]) -> ProjectUrlTable {
    let mut table = ProjectUrlTable::new();
    for hit in hits {
        let Some(url) = hit.live_url() else {
            continue;
        };
        let project = hit.project_name();
        if project.is_empty() {
            tracing::debug!(url = %url, "Skipping live_url on hit without a project name");
            continue;
        }
        table.insert(project, url);
    }
    table
}

/// Context string for the model: the URL block (when non-empty) followed by
/// each hit's content.
pub fn build_context(hits: &[RetrievalHit], urls: &ProjectUrlTable) -> String {
    let mut parts: Vec<String> = Vec::new();

    if !urls.is_empty() {
        parts.push(URL_HEADER.to_string());
        for (project, url) in urls.iter() {
            parts.push(format!("{URL_LINE_PREFIX}{project}: {url}"));
        }
        parts.push(CONTEXT_HEADER.to_string());
    }

    for hit in hits {
        parts.push(format!("{HIT_DELIMITER}{}", hit.content));
    }

    parts.join("\n")
}

/// Recover the URL table from a context string built by [`build_context`].
///
/// Reads every `  • <project>: <url>` line whose URL starts with `http://` or
/// `https://`; the URL ends at the first whitespace.
pub fn parse_url_table(context: &str) -> ProjectUrlTable {
    let mut table = ProjectUrlTable::new();

    for line in context.lines() {
        let Some(start) = line.find(URL_LINE_PREFIX) else {
            continue;
        };
        let rest = &line[start + URL_LINE_PREFIX.len()..];
        if let Some((project, url)) = split_project_url(rest) {
            table.insert(project.trim(), url);
        }
    }

    table
}

fn split_project_url(rest: &str) -> Option<(&str, &str)> {
    let mut from = 0;
    while let Some(offset) = rest[from..].find(": ") {
        let sep = from + offset;
        let candidate = &rest[sep + 2..];
        let scheme_len = if candidate.starts_with("https://") {
            8
        } else if candidate.starts_with("http://") {
            7
        } else {
            0
        };
        if sep > 0 && scheme_len > 0 {
            let end = candidate
                .find(char::is_whitespace)
                .unwrap_or(candidate.len());
            if end > scheme_len {
                return Some((&rest[..sep], &candidate[..end]));
            }
        }
        from = sep + 2;
    }
    None
}

/// Result of one portfolio search.
#[derive(Debug, Clone)]
pub struct PortfolioSearch {
    /// Context string for the model.
    pub context: String,
    /// URL table extracted from the hits.
    pub urls: ProjectUrlTable,
    /// The hits, most similar first.
    pub hits: Vec<RetrievalHit>,
}

/// Run a similarity search and build the context and URL table.
///
/// Index failures are propagated unchanged; there is no retry here.
pub async fn search(
    index: &dyn VectorIndex,
    query: &str,
    k: usize,
) -> anyhow::Result<PortfolioSearch> {
    let hits = index.similarity_search(query, k).await?;
    let urls = extract_url_table(&hits);
    let context = build_context(&hits, &urls);

    tracing::debug!(
        query = %query,
        hit_count = hits.len(),
        url_count = urls.len(),
        "Portfolio search completed"
    );

    Ok(PortfolioSearch {
        context,
        urls,
        hits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(name: &str, url: Value) -> RetrievalHit {
        RetrievalHit::new(format!("{name} details"))
            .with_metadata("name", name)
            .with_metadata("live_url", url)
    }

    #[test]
    fn test_project_name_prefers_name() {
        let hit = RetrievalHit::new("x")
            .with_metadata("name", "findkairos")
            .with_metadata("file_name", "kairos.md");
        assert_eq!(hit.project_name(), "findkairos");
    }

    #[test]
    fn test_project_name_from_file_name() {
        let hit = RetrievalHit::new("x").with_metadata("file_name", "jaspercycles.md");
        assert_eq!(hit.project_name(), "jaspercycles");
        let pdf = RetrievalHit::new("x").with_metadata("file_name", "CV.PDF");
        assert_eq!(pdf.project_name(), "CV");
        let none = RetrievalHit::new("x");
        assert_eq!(none.project_name(), "");
    }

    #[test]
    fn test_sentinel_urls_are_not_present() {
        for sentinel in [
            Value::Null,
            Value::from("null"),
            Value::from("NULL"),
            Value::from(""),
            Value::from("   "),
            Value::from(42),
        ] {
            let hit = project("p", sentinel.clone());
            assert_eq!(hit.live_url(), None, "{sentinel:?}");
        }
        assert_eq!(
            project("p", Value::from("https://p.dev")).live_url(),
            Some("https://p.dev")
        );
    }

    #[test]
    fn test_extract_url_table_skips_missing() {
        let hits = vec![
            project("findkairos", Value::from("https://findkairos.com")),
            project("git-log", Value::from("null")),
            RetrievalHit::new("cv").with_metadata("file_name", "cv.pdf"),
            project("jaspercycles", Value::from("https://jaspercycles.com")),
        ];
        let table = extract_url_table(&hits);
        let entries: Vec<_> = table.iter().collect();
        assert_eq!(
            entries,
            vec![
                ("findkairos", "https://findkairos.com"),
                ("jaspercycles", "https://jaspercycles.com"),
            ]
        );
    }

    #[test]
    fn test_table_overwrite_keeps_position() {
        let mut table = ProjectUrlTable::new();
        table.insert("a", "https://a.one");
        table.insert("b", "https://b.one");
        table.insert("a", "https://a.two");
        let entries: Vec<_> = table.iter().collect();
        assert_eq!(entries, vec![("a", "https://a.two"), ("b", "https://b.one")]);
    }

    #[test]
    fn test_table_keys_compare_case_insensitively() {
        let mut table = ProjectUrlTable::new();
        table.insert("FindKairos", "https://findkairos.com");
        table.insert("jaspercycles", "https://jaspercycles.com");
        table.insert("findkairos", "https://findkairos.com/v2");
        let entries: Vec<_> = table.iter().collect();
        assert_eq!(
            entries,
            vec![
                ("FindKairos", "https://findkairos.com/v2"),
                ("jaspercycles", "https://jaspercycles.com"),
            ]
        );
        assert_eq!(table.get("FINDKAIROS"), Some("https://findkairos.com/v2"));
    }

    #[test]
    fn test_differently_cased_hits_share_one_header_line() {
        let hits = vec![
            project("FindKairos", Value::from("https://findkairos.com")),
            RetrievalHit::new("more")
                .with_metadata("file_name", "findkairos.md")
                .with_metadata("live_url", "https://findkairos.com"),
        ];
        let urls = extract_url_table(&hits);
        assert_eq!(urls.len(), 1);
        let context = build_context(&hits, &urls);
        assert_eq!(context.matches("  • ").count(), 1);
        assert_eq!(parse_url_table(&context), urls);
    }

    #[test]
    fn test_context_without_urls_has_no_header() {
        let hits = vec![RetrievalHit::new("first"), RetrievalHit::new("second")];
        let context = build_context(&hits, &ProjectUrlTable::new());
        assert_eq!(context, "\n---\nfirst\n\n---\nsecond");
        assert!(!context.contains(URL_HEADER));
    }

    #[test]
    fn test_context_header_lists_urls() {
        let hits = vec![project("findkairos", Value::from("https://findkairos.com"))];
        let urls = extract_url_table(&hits);
        let context = build_context(&hits, &urls);
        assert!(context.starts_with(URL_HEADER));
        assert!(context.contains("  • findkairos: https://findkairos.com\n"));
        assert!(context.ends_with("\n---\nfindkairos details"));
    }

    #[test]
    fn test_parse_reads_back_built_context() {
        let hits = vec![
            project("findkairos", Value::from("https://findkairos.com")),
            project("Portfolio: v2", Value::from("http://example.org/p?x=1")),
        ];
        let urls = extract_url_table(&hits);
        let parsed = parse_url_table(&build_context(&hits, &urls));
        assert_eq!(parsed, urls);
    }

    #[test]
    fn test_parse_ignores_non_url_lines() {
        let parsed = parse_url_table("  • notes: see below\nplain text\n  • : https://x.y");
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_table_serializes_in_order() {
        let table: ProjectUrlTable = [("z", "https://z"), ("a", "https://a")]
            .into_iter()
            .collect();
        assert_eq!(
            serde_json::to_string(&table).unwrap(),
            r#"{"z":"https://z","a":"https://a"}"#
        );
    }
}
