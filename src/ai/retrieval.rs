//! Retrieval side-call
//!
//! Before generating, a send with attached files asks the retrieval endpoint
//! for the snippets most relevant to the user's message.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{EmbeddingsProvider, FileItem};

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Retrieval request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Body of a retrieval request
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalQuery {
    pub user_input: String,
    pub file_ids: Vec<String>,
    pub embeddings_provider: EmbeddingsProvider,
    pub source_count: u32,
}

#[derive(Debug, Deserialize)]
struct RetrievalResponse {
    #[serde(default)]
    results: Vec<FileItem>,
}

/// Finds reference snippets for a query
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &RetrievalQuery) -> Result<Vec<FileItem>, RetrievalError>;
}

/// Retriever backed by `POST /api/retrieval/retrieve`
pub struct HttpRetriever {
    client: Client,
    url: String,
}

impl HttpRetriever {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Retriever for HttpRetriever {
    async fn retrieve(&self, query: &RetrievalQuery) -> Result<Vec<FileItem>, RetrievalError> {
        let response = self.client.post(&self.url).json(query).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            log::error!("Error retrieving: {} - {}", status, body);
            return Ok(Vec::new());
        }

        let body: RetrievalResponse = response.json().await?;
        log::debug!(
            "Retrieved {} snippets from {} files",
            body.results.len(),
            query.file_ids.len()
        );
        Ok(body.results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn query() -> RetrievalQuery {
        RetrievalQuery {
            user_input: "what is in the file?".to_string(),
            file_ids: vec!["f1".to_string(), "f2".to_string()],
            embeddings_provider: EmbeddingsProvider::Local,
            source_count: 4,
        }
    }

    #[tokio::test]
    async fn test_retrieve_returns_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/retrieval/retrieve"))
            .and(body_json(json!({
                "userInput": "what is in the file?",
                "fileIds": ["f1", "f2"],
                "embeddingsProvider": "local",
                "sourceCount": 4
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"id": "fi1", "fileId": "f1", "content": "snippet", "tokens": 3}]
            })))
            .mount(&server)
            .await;

        let retriever = HttpRetriever::new(
            Client::new(),
            format!("{}/api/retrieval/retrieve", server.uri()),
        );
        let results = retriever.retrieve(&query()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "snippet");
    }

    #[tokio::test]
    async fn test_failed_status_yields_no_snippets() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let retriever = HttpRetriever::new(Client::new(), server.uri());
        let results = retriever.retrieve(&query()).await.unwrap();
        assert!(results.is_empty());
    }
}
