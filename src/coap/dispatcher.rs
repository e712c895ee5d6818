//! Routes decoded requests to the resource handlers described in §4.5 and
//! maps their outcomes onto CoAP response codes.

use std::cell::RefCell;
use std::rc::Rc;

use coap_lite::ResponseType;
use tracing::{debug, warn};

use crate::backend::RdfBackend;
use crate::prefix::{BodyFormat, PrefixRegistry};
use crate::subscription::{self, Deregistration, SubscriptionRegistry};

use super::resource::ResourceTree;
use super::{IncomingRequest, Method, OutgoingResponse};

/// Everything a request handler needs: the shared registries and the
/// chosen backend. Owned by [`super::Server`] and handed to the dispatcher
/// by reference.
pub struct RequestDispatcher {
    pub prefixes: RefCell<PrefixRegistry>,
    pub subscriptions: RefCell<SubscriptionRegistry>,
    pub resources: RefCell<ResourceTree>,
    pub backend: Box<dyn RdfBackend>,
    pub info_document: Vec<u8>,
}

/// What the caller (the server's event loop) should do after a dispatch
/// completes.
pub enum Effect {
    None,
    /// A `/sparql/update` succeeded: schedule `notify_all()` once the
    /// response has been sent (§4.6).
    NotifyAll,
    /// A subscription lost its last observer: its resource should stop
    /// being routable.
    SubscriptionRemoved(String),
}

impl RequestDispatcher {
    pub fn new(
        prefixes: PrefixRegistry,
        backend: Box<dyn RdfBackend>,
        info_document: Vec<u8>,
    ) -> Rc<Self> {
        Rc::new(Self {
            prefixes: RefCell::new(prefixes),
            subscriptions: RefCell::new(SubscriptionRegistry::new()),
            resources: RefCell::new(ResourceTree::new()),
            backend,
            info_document,
        })
    }

    pub async fn dispatch(&self, req: IncomingRequest) -> (OutgoingResponse, Effect) {
        let path: Vec<&str> = req.path.iter().map(String::as_str).collect();
        debug!("{:?} /{} from {}", req.method, path.join("/"), req.hostinfo());

        match (req.method, path.as_slice()) {
            (Method::Get, [".well-known", "core"]) => (
                OutgoingResponse::new(
                    ResponseType::Content,
                    self.resources.borrow().link_format().into_bytes(),
                ),
                Effect::None,
            ),
            (Method::Get, [super::PATH_INFO]) => (
                OutgoingResponse::new(ResponseType::Content, self.info_document.clone()),
                Effect::None,
            ),
            (Method::Get, [super::PATH_SPARQL, super::PATH_QUERY]) => {
                (self.handle_query(&req.payload).await, Effect::None)
            }
            (Method::Post, [super::PATH_SPARQL, super::PATH_UPDATE]) => self.handle_update(&req).await,
            (Method::Post, [super::PATH_SPARQL, super::PATH_SUBSCRIPTION]) => {
                (self.handle_subscribe(&req.payload).await, Effect::None)
            }
            (Method::Get, [super::PATH_SPARQL, super::PATH_SUBSCRIPTION]) => {
                (self.handle_subscription_info(&req.payload), Effect::None)
            }
            (Method::Delete, [super::PATH_SPARQL, super::PATH_SUBSCRIPTION]) => (
                OutgoingResponse::new(
                    ResponseType::BadRequest,
                    b"Use GET request to subscription resource with observe flag =1".to_vec(),
                ),
                Effect::None,
            ),
            (Method::Get, [fp]) if self.subscriptions.borrow().contains(fp) => {
                self.handle_subscription_resource(fp, &req).await
            }
            _ => (OutgoingResponse::empty(ResponseType::NotFound), Effect::None),
        }
    }

    async fn handle_query(&self, payload: &[u8]) -> OutgoingResponse {
        if payload.is_empty() {
            return OutgoingResponse::empty(ResponseType::BadOption);
        }
        let text = String::from_utf8_lossy(payload);
        let prefixed = self.prefixes.borrow().prepend_sparql(&text);
        match self.backend.query(&prefixed).await {
            Ok(result) => {
                let shortened = self.prefixes.borrow().shorten(&result);
                OutgoingResponse::new(ResponseType::Content, shortened)
            }
            Err(e) => {
                warn!("query failed: {}", e);
                OutgoingResponse::empty(ResponseType::BadRequest)
            }
        }
    }

    async fn handle_update(&self, req: &IncomingRequest) -> (OutgoingResponse, Effect) {
        if req.payload.is_empty() {
            return (OutgoingResponse::empty(ResponseType::BadOption), Effect::None);
        }
        let text = String::from_utf8_lossy(&req.payload);

        let format = match &req.format_option {
            Some(raw) => parse_format_option(raw),
            None => BodyFormat::Sparql,
        };

        // An unrecognized `format=` value is still forwarded: the backend
        // is the one that rejects it with `UnknownFormat`, not the
        // dispatcher (§4.5, §9).
        let prefixed = self.prefixes.borrow().prepend_for(format, &text);
        match self.backend.update(&prefixed, format).await {
            Ok(()) => (
                OutgoingResponse::empty(ResponseType::Changed),
                Effect::NotifyAll,
            ),
            Err(e) => {
                warn!("update failed: {}", e);
                (OutgoingResponse::empty(ResponseType::BadRequest), Effect::None)
            }
        }
    }

    async fn handle_subscribe(&self, payload: &[u8]) -> OutgoingResponse {
        if payload.is_empty() {
            return OutgoingResponse::empty(ResponseType::BadOption);
        }
        // `get_or_create` takes the registry by `&RefCell<..>`, not a
        // `borrow_mut()` guard held across its `await`: its initial query is
        // a real HTTP round-trip for the remote backends, and a `notify_all`
        // task spawned by a prior update can be polled while it's in flight
        // (§5). `PrefixRegistry` is only ever read, never mutably borrowed
        // at runtime, so holding this `Ref` across the await is safe.
        let prefixes = self.prefixes.borrow();
        let result = subscription::get_or_create(&self.subscriptions, payload, &prefixes, self.backend.as_ref())
            .await;
        drop(prefixes);
        match result {
            Ok((fp, created)) => {
                if created {
                    self.resources.borrow_mut().mount_subscription(&fp);
                }
                OutgoingResponse::new(ResponseType::Created, fp.into_bytes())
            }
            Err(e) => {
                warn!("subscription creation failed: {}", e);
                OutgoingResponse::empty(ResponseType::BadRequest)
            }
        }
    }

    fn handle_subscription_info(&self, payload: &[u8]) -> OutgoingResponse {
        if payload.is_empty() {
            return OutgoingResponse::empty(ResponseType::NotFound);
        }
        let fp = String::from_utf8_lossy(payload);
        match self.subscriptions.borrow().info(&fp) {
            Some(info) => {
                let body = serde_json::to_vec(&info).unwrap_or_default();
                OutgoingResponse::new(ResponseType::Content, body)
            }
            None => OutgoingResponse::empty(ResponseType::BadRequest),
        }
    }

    async fn handle_subscription_resource(
        &self,
        fp: &str,
        req: &IncomingRequest,
    ) -> (OutgoingResponse, Effect) {
        let Some(shared) = self.subscriptions.borrow().get(fp) else {
            return (OutgoingResponse::empty(ResponseType::NotFound), Effect::None);
        };
        let identity = req.hostinfo();

        match req.observe {
            Some(1) => {
                let outcome = shared.borrow_mut().deregister_observer(&identity);
                match outcome {
                    Deregistration::NotObserving => {
                        (OutgoingResponse::empty(ResponseType::Forbidden), Effect::None)
                    }
                    Deregistration::StillObserved => {
                        (OutgoingResponse::empty(ResponseType::Changed), Effect::None)
                    }
                    Deregistration::LastObserverRemoved => {
                        self.subscriptions.borrow_mut().remove(fp);
                        self.resources.borrow_mut().unmount_subscription(fp);
                        (
                            OutgoingResponse::empty(ResponseType::Deleted),
                            Effect::SubscriptionRemoved(fp.to_string()),
                        )
                    }
                }
            }
            _ => {
                shared
                    .borrow_mut()
                    .register_observer(&identity, req.source, req.token.clone());
                let shortened = {
                    let prefixes = self.prefixes.borrow();
                    let sub = shared.borrow();
                    prefixes.shorten(sub.last_result())
                };
                let seq = shared.borrow().observe_seq();
                (
                    OutgoingResponse::new(ResponseType::Content, shortened).with_observe(seq),
                    Effect::None,
                )
            }
        }
    }
}

/// Parse a `format=<x>` CoAP string option into a [`BodyFormat`]. An
/// option value with no `=` or an empty right-hand side is treated as
/// `Unknown`, same as any other unrecognized value (§9's redesign flag).
fn parse_format_option(raw: &str) -> BodyFormat {
    match raw.split_once('=') {
        Some(("format", value)) => BodyFormat::parse(value),
        _ => BodyFormat::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalGraphBackend;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    fn dispatcher() -> Rc<RequestDispatcher> {
        RequestDispatcher::new(
            PrefixRegistry::empty(),
            Box::new(LocalGraphBackend::new().unwrap()),
            b"musepa broker".to_vec(),
        )
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    fn request(method: Method, path: &[&str], payload: &[u8]) -> IncomingRequest {
        IncomingRequest {
            method,
            path: path.iter().map(|s| s.to_string()).collect(),
            payload: payload.to_vec(),
            observe: None,
            format_option: None,
            token: vec![1, 2, 3],
            source: addr(6000),
        }
    }

    #[test]
    fn test_format_option_parsing() {
        assert_eq!(parse_format_option("format=ttl"), BodyFormat::Ttl);
        assert_eq!(parse_format_option("format=n3"), BodyFormat::N3);
        assert_eq!(parse_format_option("format=rdfxml"), BodyFormat::Unknown);
        assert_eq!(parse_format_option("garbage"), BodyFormat::Unknown);
    }

    #[tokio::test]
    async fn test_info_returns_content() {
        let d = dispatcher();
        let (resp, _) = d.dispatch(request(Method::Get, &["info"], b"")).await;
        assert_eq!(resp.status, ResponseType::Content);
        assert_eq!(resp.payload, b"musepa broker");
    }

    #[tokio::test]
    async fn test_empty_update_is_bad_option() {
        let d = dispatcher();
        let (resp, _) = d
            .dispatch(request(Method::Post, &["sparql", "update"], b""))
            .await;
        assert_eq!(resp.status, ResponseType::BadOption);
    }

    #[tokio::test]
    async fn test_s1_insert_then_count() {
        let d = dispatcher();
        let (resp, effect) = d
            .dispatch(request(
                Method::Post,
                &["sparql", "update"],
                b"INSERT DATA { <http://a> <http://b> <http://c> }",
            ))
            .await;
        assert_eq!(resp.status, ResponseType::Changed);
        assert!(matches!(effect, Effect::NotifyAll));

        let (resp, _) = d
            .dispatch(request(
                Method::Get,
                &["sparql", "query"],
                b"SELECT (COUNT(*) AS ?n) WHERE { ?s ?p ?o }",
            ))
            .await;
        assert_eq!(resp.status, ResponseType::Content);
        let json: serde_json::Value = serde_json::from_slice(&resp.payload).unwrap();
        assert_eq!(json["results"]["bindings"][0]["n"]["value"].as_str(), Some("1"));
    }

    #[tokio::test]
    async fn test_s3_malformed_update_is_bad_request() {
        let d = dispatcher();
        let (resp, effect) = d
            .dispatch(request(
                Method::Post,
                &["sparql", "update"],
                b"DELETE ?a ?b ?c WHERE ?a ?b ?c",
            ))
            .await;
        assert_eq!(resp.status, ResponseType::BadRequest);
        assert!(matches!(effect, Effect::None));
    }

    #[tokio::test]
    async fn test_s4_ttl_update_then_count() {
        let d = dispatcher();
        let mut req = request(
            Method::Post,
            &["sparql", "update"],
            b"@prefix : <http://t/>. :a :b :c .",
        );
        req.format_option = Some("format=ttl".to_string());
        let (resp, _) = d.dispatch(req).await;
        assert_eq!(resp.status, ResponseType::Changed);

        let (resp, _) = d
            .dispatch(request(
                Method::Get,
                &["sparql", "query"],
                b"SELECT (COUNT(*) AS ?n) WHERE { ?s ?p ?o }",
            ))
            .await;
        let json: serde_json::Value = serde_json::from_slice(&resp.payload).unwrap();
        assert_eq!(json["results"]["bindings"][0]["n"]["value"].as_str(), Some("1"));
    }

    #[tokio::test]
    async fn test_unknown_format_is_bad_request() {
        let d = dispatcher();
        let mut req = request(Method::Post, &["sparql", "update"], b"whatever");
        req.format_option = Some("format=rdfxml".to_string());
        let (resp, _) = d.dispatch(req).await;
        assert_eq!(resp.status, ResponseType::BadRequest);
    }

    #[tokio::test]
    async fn test_subscription_create_observe_unsubscribe_lifecycle() {
        let d = dispatcher();
        let payload = b"SELECT ?s ?p ?o WHERE { ?s ?p ?o }";

        let (resp, _) = d
            .dispatch(request(Method::Post, &["sparql", "subscription"], payload))
            .await;
        assert_eq!(resp.status, ResponseType::Created);
        let fp = String::from_utf8(resp.payload).unwrap();
        assert_eq!(fp.len(), 32);

        let mut observe_req = request(Method::Get, &[&fp], b"");
        observe_req.observe = Some(0);
        observe_req.source = addr(7000);
        let (resp, _) = d.dispatch(observe_req.clone()).await;
        assert_eq!(resp.status, ResponseType::Content);
        assert_eq!(resp.observe, Some(0));

        // Same client re-registering is idempotent: clients stays 1.
        d.dispatch(observe_req.clone()).await;
        let info = d.subscriptions.borrow().info(&fp).unwrap();
        assert_eq!(info.clients, 1);

        let mut unsub_req = observe_req.clone();
        unsub_req.observe = Some(1);
        let (resp, effect) = d.dispatch(unsub_req).await;
        assert_eq!(resp.status, ResponseType::Deleted);
        assert!(matches!(effect, Effect::SubscriptionRemoved(_)));

        // Resource is gone now.
        let mut reobserve = observe_req;
        reobserve.observe = Some(0);
        let (resp, _) = d.dispatch(reobserve).await;
        assert_eq!(resp.status, ResponseType::NotFound);
    }

    #[tokio::test]
    async fn test_deregister_by_non_observer_is_forbidden() {
        let d = dispatcher();
        let payload = b"SELECT ?s ?p ?o WHERE { ?s ?p ?o }";
        let (resp, _) = d
            .dispatch(request(Method::Post, &["sparql", "subscription"], payload))
            .await;
        let fp = String::from_utf8(resp.payload).unwrap();

        let mut req = request(Method::Get, &[&fp], b"");
        req.observe = Some(1);
        let (resp, _) = d.dispatch(req).await;
        assert_eq!(resp.status, ResponseType::Forbidden);
    }

    #[tokio::test]
    async fn test_delete_subscription_is_always_bad_request() {
        let d = dispatcher();
        let (resp, _) = d
            .dispatch(request(Method::Delete, &["sparql", "subscription"], b""))
            .await;
        assert_eq!(resp.status, ResponseType::BadRequest);
    }

    #[tokio::test]
    async fn test_subscription_info_empty_payload_is_not_found() {
        let d = dispatcher();
        let (resp, _) = d
            .dispatch(request(Method::Get, &["sparql", "subscription"], b""))
            .await;
        assert_eq!(resp.status, ResponseType::NotFound);
    }

    #[tokio::test]
    async fn test_well_known_core_lists_static_and_dynamic_resources() {
        let d = dispatcher();
        let payload = b"SELECT ?s ?p ?o WHERE { ?s ?p ?o }";
        let (resp, _) = d
            .dispatch(request(Method::Post, &["sparql", "subscription"], payload))
            .await;
        let fp = String::from_utf8(resp.payload).unwrap();

        let (resp, _) = d
            .dispatch(request(Method::Get, &[".well-known", "core"], b""))
            .await;
        let body = String::from_utf8(resp.payload).unwrap();
        assert!(body.contains("</sparql/query>"));
        assert!(body.contains(&format!("</{}>;obs", fp)));
    }

    #[tokio::test]
    async fn test_subscription_info_unknown_fingerprint_is_bad_request() {
        let d = dispatcher();
        let (resp, _) = d
            .dispatch(request(
                Method::Get,
                &["sparql", "subscription"],
                b"deadbeefdeadbeefdeadbeefdeadbeef",
            ))
            .await;
        assert_eq!(resp.status, ResponseType::BadRequest);
    }
}
