use super::{VectorIndex, search};
use crate::tools::NativeTool;
use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Name the model uses to call the portfolio search.
pub const SEARCH_TOOL_NAME: &str = "search_portfolio";

/// The retrieval tool exposed to the agent.
#[derive(Debug)]
pub struct PortfolioSearchTool {
    index: Arc<dyn VectorIndex>,
    k: usize,
}

impl PortfolioSearchTool {
    pub fn new(index: Arc<dyn VectorIndex>, k: usize) -> Self {
        Self { index, k }
    }
}

#[async_trait]
impl NativeTool for PortfolioSearchTool {
    fn name(&self) -> &str {
        SEARCH_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Search through the portfolio documents including CV, projects, and experience. \
         Use this tool when the user asks about background, skills, projects, or experience."
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to look for in the portfolio."
                }
            },
            "required": ["query"]
        })
    }

    async fn call(&self, args: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let query = args["query"]
            .as_str()
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| anyhow!("Missing query"))?;

        let result = search(self.index.as_ref(), query, self.k).await?;
        tracing::info!(
            tool_name = SEARCH_TOOL_NAME,
            hit_count = result.hits.len(),
            project_urls = ?result.urls,
            "Portfolio search tool executed"
        );

        Ok(serde_json::Value::String(result.context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::{RetrievalHit, parse_url_table};

    #[derive(Debug)]
    struct FixedIndex(Vec<RetrievalHit>);

    #[async_trait]
    impl VectorIndex for FixedIndex {
        async fn similarity_search(
            &self,
            _query: &str,
            k: usize,
        ) -> anyhow::Result<Vec<RetrievalHit>> {
            Ok(self.0.iter().take(k).cloned().collect())
        }
    }

    #[derive(Debug)]
    struct BrokenIndex;

    #[async_trait]
    impl VectorIndex for BrokenIndex {
        async fn similarity_search(
            &self,
            _query: &str,
            _k: usize,
        ) -> anyhow::Result<Vec<RetrievalHit>> {
            Err(anyhow!("index unreachable"))
        }
    }

    #[tokio::test]
    async fn test_result_carries_url_block() {
        let index = FixedIndex(vec![
            RetrievalHit::new("Kairos connects bikepackers")
                .with_metadata("name", "findkairos")
                .with_metadata("live_url", "https://findkairos.com"),
            RetrievalHit::new("unused"),
        ]);
        let tool = PortfolioSearchTool::new(Arc::new(index), 1);

        let out = tool.call(json!({"query": "projects"})).await.unwrap();
        let text = out.as_str().unwrap();
        assert!(text.contains("Kairos connects bikepackers"));
        assert!(!text.contains("unused"));
        assert_eq!(
            parse_url_table(text).get("findkairos"),
            Some("https://findkairos.com")
        );
    }

    #[tokio::test]
    async fn test_index_failure_propagates() {
        let tool = PortfolioSearchTool::new(Arc::new(BrokenIndex), 3);
        let err = tool.call(json!({"query": "cv"})).await.unwrap_err();
        assert!(err.to_string().contains("index unreachable"));
    }

    #[tokio::test]
    async fn test_missing_query_is_rejected() {
        let tool = PortfolioSearchTool::new(Arc::new(FixedIndex(vec![])), 3);
        assert!(tool.call(json!({})).await.is_err());
    }
}
