//! Elasticsearch index over the REST API.
//!
//! Documents are written with `PUT /{index}/_doc/{id}`, so re-delivering a
//! message overwrites its previous version instead of adding a second hit.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use super::{IndexDocument, IndexError, IndexResult, SearchIndex, SearchQuery};
use crate::config::IndexSettings;

/// Field mapping applied when the index is created.
fn index_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "id": { "type": "keyword" },
                "account_id": { "type": "keyword" },
                "folder": { "type": "keyword" },
                "uid": { "type": "long" },
                "message_id": { "type": "keyword" },
                "subject": { "type": "text" },
                "from": { "type": "text", "fields": { "raw": { "type": "keyword" } } },
                "to": { "type": "text" },
                "date": { "type": "date" },
                "text": { "type": "text" },
                "html": { "type": "text", "index": false },
                "category": { "type": "keyword" },
                "attachments": { "type": "keyword" }
            }
        }
    })
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: Hits,
}

#[derive(Debug, Deserialize)]
struct Hits {
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_source")]
    source: IndexDocument,
}

/// Search index backed by an Elasticsearch cluster.
#[derive(Debug, Clone)]
pub struct ElasticsearchIndex {
    client: reqwest::Client,
    base_url: Url,
    index: String,
    credentials: Option<(String, String)>,
    default_size: usize,
}

impl ElasticsearchIndex {
    /// Creates an index client from settings.
    ///
    /// `password` is the basic-auth password for `settings.username`, if any.
    pub fn new(settings: &IndexSettings, password: Option<String>) -> IndexResult<Self> {
        let base_url = Url::parse(&format!("{}/", settings.url.trim_end_matches('/')))
            .map_err(|e| IndexError::Config(format!("invalid url {}: {}", settings.url, e)))?;
        if settings.index.is_empty() {
            return Err(IndexError::Config("index name is empty".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()?;

        let credentials = settings
            .username
            .clone()
            .map(|user| (user, password.unwrap_or_default()));

        Ok(Self {
            client,
            base_url,
            index: settings.index.clone(),
            credentials,
            default_size: settings.default_search_size,
        })
    }

    /// Builds `{base}/{index}/{segments...}` with each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> IndexResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| IndexError::Config("url cannot be a base".to_string()))?;
            path.pop_if_empty().push(&self.index);
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match self.credentials {
            Some((ref user, ref password)) => builder.basic_auth(user, Some(password)),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> IndexResult<reqwest::Response> {
        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                IndexError::Timeout
            } else if e.is_connect() {
                IndexError::Unavailable(e.to_string())
            } else {
                IndexError::Http(e)
            }
        })
    }

    async fn check(response: reqwest::Response) -> IndexResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(IndexError::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// Elasticsearch request body for a query.
    fn search_body(&self, query: &SearchQuery) -> Value {
        let mut filters = Vec::new();
        if let Some(ref account_id) = query.account_id {
            filters.push(json!({ "term": { "account_id": account_id.0 } }));
        }
        if let Some(ref folder) = query.folder {
            filters.push(json!({ "term": { "folder": folder } }));
        }
        if let Some(category) = query.category {
            filters.push(json!({ "term": { "category": category } }));
        }

        let must = match query.text.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => json!([{
                "multi_match": {
                    "query": text,
                    "fields": ["subject^2", "text", "from"]
                }
            }]),
            _ => json!([{ "match_all": {} }]),
        };

        json!({
            "size": query.size.unwrap_or(self.default_size),
            "query": { "bool": { "must": must, "filter": filters } },
            "sort": [{ "date": { "order": "desc" } }]
        })
    }
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    async fn ensure_index(&self) -> IndexResult<()> {
        let url = self.url(&[])?;

        let exists = self
            .send(self.request(reqwest::Method::HEAD, url.clone()))
            .await?;
        match exists.status() {
            s if s.is_success() => return Ok(()),
            StatusCode::NOT_FOUND => {}
            s => {
                return Err(IndexError::Status {
                    status: s.as_u16(),
                    body: String::new(),
                })
            }
        }

        let response = self
            .send(self.request(reqwest::Method::PUT, url).json(&index_mapping()))
            .await?;

        // Another instance may have created it between HEAD and PUT.
        if response.status() == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            if body.contains("resource_already_exists_exception") {
                return Ok(());
            }
            return Err(IndexError::Status { status: 400, body });
        }
        Self::check(response).await?;

        tracing::info!(index = %self.index, "Created search index");
        Ok(())
    }

    async fn upsert(&self, document: &IndexDocument) -> IndexResult<()> {
        let url = self.url(&["_doc", &document.id])?;

        let response = self
            .send(self.request(reqwest::Method::PUT, url).json(document))
            .await?;
        Self::check(response).await?;

        tracing::debug!(index = %self.index, id = %document.id, "Indexed document");
        Ok(())
    }

    async fn query(&self, query: &SearchQuery) -> IndexResult<Vec<IndexDocument>> {
        let url = self.url(&["_search"])?;

        let response = self
            .send(
                self.request(reqwest::Method::POST, url)
                    .json(&self.search_body(query)),
            )
            .await?;
        let response = Self::check(response).await?;

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| IndexError::InvalidResponse(e.to_string()))?;

        Ok(parsed.hits.hits.into_iter().map(|hit| hit.source).collect())
    }
}
