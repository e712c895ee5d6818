//! Remote-A: a single-endpoint, triplestore-style SPARQL HTTP backend.
//!
//! Grounded on `endpoint.py::Blazegraph` — one URL handles both query (GET
//! with `?query=`) and update (POST with `?update=` or a raw RDF body).

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use super::{check_reachable, BackendError, RdfBackend, UpdateFormat};
use crate::prefix::BodyFormat;

const DEFAULT_BASE_URL: &str = "http://localhost:9999/bigdata/sparql";

pub struct TriplestoreBackend {
    client: Client,
    base_url: String,
}

impl TriplestoreBackend {
    /// `base_url` defaults to a well-known local endpoint when omitted
    /// (`endpoint.py::get_endpoint`). Performs the one-time reachability
    /// check required by §4.2.
    pub async fn new(base_url: Option<&str>) -> Result<Self, BackendError> {
        let base_url = base_url.unwrap_or(DEFAULT_BASE_URL).to_string();
        let client = Client::new();
        check_reachable(&client, &base_url).await?;
        info!("triplestore backend reachable at {}", base_url);
        Ok(Self { client, base_url })
    }
}

#[async_trait(?Send)]
impl RdfBackend for TriplestoreBackend {
    async fn query(&self, sparql: &str) -> Result<Vec<u8>, BackendError> {
        debug!("sparql query to triplestore at {}", self.base_url);
        let response = self
            .client
            .get(&self.base_url)
            .header("Accept", "application/sparql-results+json")
            .query(&[("query", sparql)])
            .send()
            .await
            .map_err(|e| BackendError::Failed(e.to_string()))?;
        if response.status().as_u16() != 200 {
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
        let response = match UpdateFormat::from_body_format(format)? {
            UpdateFormat::Sparql => self
                .client
                .post(&self.base_url)
                .query(&[("update", content)])
                .send()
                .await,
            UpdateFormat::Ttl => self
                .client
                .post(&self.base_url)
                .header("Content-Type", "application/x-turtle")
                .body(content.to_string())
                .send()
                .await,
            UpdateFormat::N3 => self
                .client
                .post(&self.base_url)
                .header("Content-Type", "text/rdf+n3")
                .body(content.to_string())
                .send()
                .await,
        }
        .map_err(|e| BackendError::Failed(e.to_string()))?;

        debug!("update request got status {}", response.status());
        if response.status().as_u16() == 200 {
            Ok(())
        } else {
            Err(BackendError::Failed(format!(
                "update request got status {}",
                response.status()
            )))
        }
    }
}
