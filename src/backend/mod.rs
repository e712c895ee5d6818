//! The pluggable RDF backend abstraction (§4.2).
//!
//! [`RdfBackend`] is deliberately object-safe: the backend variant is chosen
//! once at startup from a CLI flag, so the server holds a single
//! `Box<dyn RdfBackend>` rather than monomorphizing over a generic. Futures
//! are boxed via `async_trait(?Send)` — the broker runs its whole event loop
//! on one thread (§5), so there is no need to pay for `Send` futures here.

mod local;
mod remote_a;
mod remote_b;

pub use local::LocalGraphBackend;
pub use remote_a::TriplestoreBackend;
pub use remote_b::DatasetBackend;

use async_trait::async_trait;
use thiserror::Error;

use crate::prefix::BodyFormat;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend is unreachable at {0}")]
    Unreachable(String),

    #[error("backend configuration error: {0}")]
    Config(String),

    #[error("backend query/update failed: {0}")]
    Failed(String),

    #[error("unknown update format '{0}'")]
    UnknownFormat(String),
}

/// The three body formats a backend's `update` accepts. Unlike
/// [`BodyFormat`], this has no `Unknown` variant: constructing one from an
/// unrecognized [`BodyFormat`] is exactly where `UnknownFormat` originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFormat {
    Sparql,
    Ttl,
    N3,
}

impl UpdateFormat {
    pub fn from_body_format(format: BodyFormat) -> Result<Self, BackendError> {
        match format {
            BodyFormat::Sparql => Ok(UpdateFormat::Sparql),
            BodyFormat::Ttl => Ok(UpdateFormat::Ttl),
            BodyFormat::N3 => Ok(UpdateFormat::N3),
            BodyFormat::Unknown => Err(BackendError::UnknownFormat("unknown".to_string())),
        }
    }
}

/// Abstract query/update operations over an RDF store.
#[async_trait(?Send)]
pub trait RdfBackend {
    /// Execute `sparql` (already prefix-expanded) and return the serialized
    /// SPARQL-Results JSON (or, for CONSTRUCT/DESCRIBE, N-Triples) bytes.
    async fn query(&self, sparql: &str) -> Result<Vec<u8>, BackendError>;

    /// Apply `content` (already prefix-expanded, when the format has a
    /// header) to the store, interpreting it per `format`.
    ///
    /// `format` is taken as the raw [`BodyFormat`] rather than the
    /// narrower [`UpdateFormat`]: an unrecognized `format=` option value is
    /// forwarded here unchanged and it is this call, via
    /// [`UpdateFormat::from_body_format`], that produces `UnknownFormat` —
    /// the dispatcher never short-circuits it (§4.5, §9).
    async fn update(&self, content: &str, format: BodyFormat) -> Result<(), BackendError>;
}

/// One GET against `base_url`, used by both remote backend constructors to
/// satisfy the "reachability check at construction time" invariant (§4.2).
pub(crate) async fn check_reachable(client: &reqwest::Client, base_url: &str) -> Result<(), BackendError> {
    let response = client
        .get(base_url)
        .send()
        .await
        .map_err(|e| BackendError::Unreachable(format!("{base_url}: {e}")))?;
    if response.status().as_u16() == 200 {
        Ok(())
    } else {
        Err(BackendError::Unreachable(format!(
            "{base_url} answered {}",
            response.status()
        )))
    }
}
