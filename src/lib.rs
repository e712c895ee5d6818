//! musepa-broker: a CoAP publish/subscribe broker fronting a pluggable RDF
//! store (§1, §2).
//!
//! A client updates the graph over `/sparql/update`, queries it over
//! `/sparql/query`, and can stand up a subscription — a SPARQL query whose
//! result set is re-evaluated after every update — over
//! `/sparql/subscription`, then observe the resulting resource with CoAP's
//! Observe option (RFC 7641) to receive a push notification each time the
//! query's result actually changes.
//!
//! The broker runs its whole event loop on a single thread (§5): every
//! shared data structure is `Rc<RefCell<..>>`, not `Arc<Mutex<..>>`, and
//! concurrency comes from cooperative `.await` points rather than OS
//! threads. See [`coap::server::Server`] for the event loop itself.

pub mod backend;
pub mod coap;
pub mod config;
pub mod prefix;
pub mod subscription;

use thiserror::Error;

/// Crate-level error, composed from each module's own leaf error type.
/// Handlers inside the dispatcher map backend/prefix errors onto CoAP
/// response codes directly (§8) rather than propagating this type; it
/// exists for the startup path in `main`, where a failure is fatal.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Prefix(#[from] prefix::PrefixError),

    #[error(transparent)]
    Backend(#[from] backend::BackendError),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("failed to bind socket")]
    Bind(#[source] std::io::Error),
}
