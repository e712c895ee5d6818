//! Remote-B: a dataset-style SPARQL HTTP backend with separate
//! `/query`, `/update`, `/data` endpoints under one base URL.
//!
//! Grounded on `endpoint.py::Fuseki` — the base parameter is mandatory
//! (there is no sensible default dataset to guess).

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::{check_reachable, BackendError, RdfBackend, UpdateFormat};
use crate::prefix::BodyFormat;

pub struct DatasetBackend {
    client: Client,
    base_url: String,
}

impl DatasetBackend {
    /// `base_url` is mandatory (`endpoint.py`: "For Fuseki endpoint, the
    /// endpoint parameter is compulsory"). Performs the one-time
    /// reachability check required by §4.2.
    pub async fn new(base_url: Option<&str>) -> Result<Self, BackendError> {
        let base_url = base_url
            .ok_or_else(|| {
                BackendError::Config("dataset backend requires a base URL parameter".to_string())
            })?
            .trim_end_matches('/')
            .to_string();
        let client = Client::new();
        check_reachable(&client, &base_url).await?;
        Ok(Self { client, base_url })
    }
}

#[async_trait(?Send)]
impl RdfBackend for DatasetBackend {
    async fn query(&self, sparql: &str) -> Result<Vec<u8>, BackendError> {
        let url = format!("{}/query", self.base_url);
        debug!("sparql query to dataset backend at {}", url);
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/sparql-query")
            .header("Accept", "application/sparql-results+json")
            .body(sparql.to_string())
            .send()
            .await
            .map_err(|e| BackendError::Failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BackendError::Failed(format!(
                "query request got status {}",
                response.status()
            )));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| BackendError::Failed(e.to_string()))
    }

    async fn update(&self, content: &str, format: BodyFormat) -> Result<(), BackendError> {
        let (url, content_type) = match UpdateFormat::from_body_format(format)? {
            UpdateFormat::Sparql => (
                format!("{}/update", self.base_url),
                "application/sparql-update",
            ),
            UpdateFormat::Ttl | UpdateFormat::N3 => {
                (format!("{}/data", self.base_url), "text/n3; charset=utf-8")
            }
        };
        let response = self
            .client
            .post(&url)
            .header("Content-Type", content_type)
            .body(content.to_string())
            .send()
            .await
            .map_err(|e| BackendError::Failed(e.to_string()))?;

        debug!("update request got status {}", response.status());
        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Failed(format!(
                "update request got status {}",
                response.status()
            )))
        }
    }
}
