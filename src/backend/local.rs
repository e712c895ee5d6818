//! The in-process RDF graph backend: an [`oxigraph::store::Store`] wrapped
//! in a `RefCell`. Reads and writes are serialized by the single-threaded
//! event loop (§5), so no internal locking is needed here.

use std::cell::RefCell;

use async_trait::async_trait;
use oxigraph::io::{RdfFormat, RdfSerializer};
use oxigraph::sparql::{QueryResults, QueryResultsFormat};
use oxigraph::store::Store;
use tracing::debug;

use super::{BackendError, RdfBackend, UpdateFormat};
use crate::prefix::BodyFormat;

pub struct LocalGraphBackend {
    store: RefCell<Store>,
}

impl LocalGraphBackend {
    /// An empty in-memory store. No reachability check applies (§4.2).
    pub fn new() -> Result<Self, BackendError> {
        let store = Store::new().map_err(|e| BackendError::Config(e.to_string()))?;
        Ok(Self {
            store: RefCell::new(store),
        })
    }
}

#[async_trait(?Send)]
impl RdfBackend for LocalGraphBackend {
    async fn query(&self, sparql: &str) -> Result<Vec<u8>, BackendError> {
        let results = self
            .store
            .borrow()
            .query(sparql)
            .map_err(|e| BackendError::Failed(e.to_string()))?;

        let mut buf = Vec::new();
        match results {
            QueryResults::Graph(triples) => {
                // CONSTRUCT/DESCRIBE have no SPARQL-Results JSON shape;
                // serialize the resulting graph as N-Triples instead (§4.2).
                let mut writer = RdfSerializer::from_format(RdfFormat::NTriples).for_writer(&mut buf);
                for triple in triples {
                    let triple = triple.map_err(|e| BackendError::Failed(e.to_string()))?;
                    writer
                        .write_triple(&triple)
                        .map_err(|e| BackendError::Failed(e.to_string()))?;
                }
                writer.finish().map_err(|e| BackendError::Failed(e.to_string()))?;
            }
            solutions_or_boolean => {
                solutions_or_boolean
                    .write(&mut buf, QueryResultsFormat::Json)
                    .map_err(|e| BackendError::Failed(e.to_string()))?;
            }
        }
        debug!("local query returned {} bytes", buf.len());
        Ok(buf)
    }

    async fn update(&self, content: &str, format: BodyFormat) -> Result<(), BackendError> {
        match UpdateFormat::from_body_format(format)? {
            UpdateFormat::Sparql => {
                self.store
                    .borrow()
                    .update(content)
                    .map_err(|e| BackendError::Failed(e.to_string()))?;
            }
            UpdateFormat::Ttl | UpdateFormat::N3 => {
                // N3 bodies are accepted as Turtle-compatible plain triple
                // sets; N3 formulas/quantified variables are out of scope.
                self.store
                    .borrow()
                    .load_from_reader(RdfFormat::Turtle, content.as_bytes())
                    .map_err(|e| BackendError::Failed(e.to_string()))?;
            }
        }
        Ok(())
    }
}
