//! CoAP resource tree and request dispatch (§4.5, §4.6, §6).
//!
//! This module deliberately does not lean on `coap-lite` for anything
//! beyond wire encoding/decoding: that crate is a message codec, not a
//! server runtime, and has no notion of Observe bookkeeping (§9). Observer
//! tracking and notification delivery are implemented by hand in
//! [`server`] and [`subscription`](crate::subscription).

pub mod dispatcher;
pub mod resource;
pub mod server;

pub use dispatcher::RequestDispatcher;
pub use server::Server;

use std::net::SocketAddr;

use coap_lite::ResponseType;

/// The subset of CoAP methods this broker's resources respond to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

/// A decoded CoAP request, stripped of wire-format concerns so the
/// dispatcher can be exercised without a live socket.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub method: Method,
    /// URI path segments, e.g. `["sparql", "query"]`.
    pub path: Vec<String>,
    pub payload: Vec<u8>,
    /// `Some(0)` = register, `Some(1)` = deregister, `None` = not an
    /// Observe request (RFC 7641).
    pub observe: Option<u32>,
    /// The raw value of a `format=<x>` string option, if present
    /// (§4.5's `/sparql/update`).
    pub format_option: Option<String>,
    pub token: Vec<u8>,
    pub source: SocketAddr,
}

impl IncomingRequest {
    pub fn hostinfo(&self) -> String {
        self.source.to_string()
    }
}

/// A dispatcher result, stripped of wire-format concerns.
#[derive(Debug, Clone)]
pub struct OutgoingResponse {
    pub status: ResponseType,
    pub payload: Vec<u8>,
    /// When `Some`, the response should carry the Observe option with this
    /// sequence value (only meaningful for `/{fingerprint}` register
    /// replies, which double as the first notification).
    pub observe: Option<u32>,
}

impl OutgoingResponse {
    pub fn new(status: ResponseType, payload: Vec<u8>) -> Self {
        Self {
            status,
            payload,
            observe: None,
        }
    }

    pub fn empty(status: ResponseType) -> Self {
        Self::new(status, Vec::new())
    }

    pub fn with_observe(mut self, seq: u32) -> Self {
        self.observe = Some(seq);
        self
    }
}

pub const PATH_INFO: &str = "info";
pub const PATH_SPARQL: &str = "sparql";
pub const PATH_QUERY: &str = "query";
pub const PATH_UPDATE: &str = "update";
pub const PATH_SUBSCRIPTION: &str = "subscription";
