//! Binds UDP sockets for IPv4/IPv6 and drives the broker's single-threaded
//! event loop (§5, §6). `coap-lite` is used purely as a wire codec; the
//! resource tree and Observe bookkeeping are implemented by hand (§9).

use std::collections::LinkedList;
use std::net::SocketAddr;
use std::rc::Rc;

use coap_lite::{CoapOption, CoapRequest, CoapResponse, MessageType, Packet, RequestType};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::subscription::{reevaluate_shared, ObserverEntry};

use super::dispatcher::Effect;
use super::{IncomingRequest, Method, OutgoingResponse, RequestDispatcher};

const MAX_DATAGRAM: usize = 65536;

/// The UDP sockets the broker listens on, shared between the receive loop
/// and the notification tasks it spawns (§4.6).
#[derive(Clone)]
struct Sockets {
    v4: Rc<UdpSocket>,
    v6: Option<Rc<UdpSocket>>,
}

impl Sockets {
    /// Pick the socket matching `addr`'s family, falling back to the IPv4
    /// socket if no IPv6 one was bound (observers are never IPv6 in that
    /// case, but this keeps the fallback total rather than panicking).
    fn for_addr(&self, addr: &SocketAddr) -> Rc<UdpSocket> {
        match (addr, &self.v6) {
            (SocketAddr::V6(_), Some(sock)) => Rc::clone(sock),
            _ => Rc::clone(&self.v4),
        }
    }
}

pub struct Server {
    dispatcher: Rc<RequestDispatcher>,
    sockets: Sockets,
}

impl Server {
    /// Bind the configured addresses. IPv6 binding is optional: a caller
    /// that only wants IPv4 passes `bind_v6: None`.
    pub async fn bind(
        dispatcher: Rc<RequestDispatcher>,
        bind_v4: SocketAddr,
        bind_v6: Option<SocketAddr>,
    ) -> std::io::Result<Self> {
        let socket_v4 = UdpSocket::bind(bind_v4).await?;
        info!("listening on {} (IPv4)", bind_v4);

        let socket_v6 = match bind_v6 {
            Some(addr) => {
                let sock = UdpSocket::bind(addr).await?;
                info!("listening on {} (IPv6)", addr);
                Some(Rc::new(sock))
            }
            None => None,
        };

        Ok(Self {
            dispatcher,
            sockets: Sockets {
                v4: Rc::new(socket_v4),
                v6: socket_v6,
            },
        })
    }

    /// Run the event loop until `shutdown` resolves. Must be driven inside
    /// a `tokio::task::LocalSet`: the dispatcher's registries and backend
    /// handle are `Rc`/`RefCell`-based (§5), so every task this loop spawns
    /// uses `spawn_local` rather than `tokio::spawn`.
    pub async fn serve(self, shutdown: impl std::future::Future<Output = ()>) {
        let Server { dispatcher, sockets } = self;

        let mut buf_v4 = vec![0u8; MAX_DATAGRAM];
        let mut buf_v6 = vec![0u8; MAX_DATAGRAM];

        tokio::pin!(shutdown);

        loop {
            let recv_v6 = async {
                match &sockets.v6 {
                    Some(sock) => sock.recv_from(&mut buf_v6).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown signal received, stopping event loop");
                    break;
                }
                res = sockets.v4.recv_from(&mut buf_v4) => {
                    match res {
                        Ok((n, peer)) => {
                            let reply_socket = Rc::clone(&sockets.v4);
                            handle_datagram(&dispatcher, &sockets, reply_socket, &buf_v4[..n], peer).await;
                        }
                        Err(e) => warn!("IPv4 socket recv error: {}", e),
                    }
                }
                res = recv_v6 => {
                    match res {
                        Ok((n, peer)) => {
                            if let Some(reply_socket) = sockets.v6.clone() {
                                handle_datagram(&dispatcher, &sockets, reply_socket, &buf_v6[..n], peer).await;
                            }
                        }
                        Err(e) => warn!("IPv6 socket recv error: {}", e),
                    }
                }
            }
        }
    }
}

async fn handle_datagram(
    dispatcher: &Rc<RequestDispatcher>,
    sockets: &Sockets,
    reply_socket: Rc<UdpSocket>,
    bytes: &[u8],
    peer: SocketAddr,
) {
    let packet = match Packet::from_bytes(bytes) {
        Ok(p) => p,
        Err(e) => {
            warn!("failed to decode CoAP packet from {}: {:?}", peer, e);
            return;
        }
    };

    let mut coap_request: CoapRequest<SocketAddr> = CoapRequest::from_packet(packet, peer);
    let Some(incoming) = to_incoming_request(&coap_request, peer) else {
        debug!("unsupported CoAP method from {}", peer);
        return;
    };

    let (response, effect) = dispatcher.dispatch(incoming).await;

    if let Some(mut coap_response) = coap_request.response.take() {
        apply_response(&mut coap_response, &response);
        match coap_response.message.to_bytes() {
            Ok(encoded) => {
                if let Err(e) = reply_socket.send_to(&encoded, peer).await {
                    warn!("failed to send response to {}: {}", peer, e);
                }
            }
            Err(e) => warn!("failed to encode response for {}: {:?}", peer, e),
        }
    }

    if let Effect::NotifyAll = effect {
        let dispatcher = Rc::clone(dispatcher);
        let sockets = sockets.clone();
        tokio::task::spawn_local(async move {
            notify_all(&dispatcher, &sockets).await;
        });
    }
}

/// Schedule every standing subscription's `reevaluate()` as its own local
/// task, in the order subscriptions were created, so one slow backend
/// query cannot delay another subscription's notification (§4.6).
///
/// Each subscription's generation number is reserved here, synchronously,
/// before its task is spawned — not inside the task after the backend
/// query completes — so that two updates applied back-to-back reserve
/// generations in application order even if their re-evaluations later
/// race an independent HTTP round-trip and finish out of order (§5).
async fn notify_all(dispatcher: &Rc<RequestDispatcher>, sockets: &Sockets) {
    let fingerprints = dispatcher.subscriptions.borrow().fingerprints();
    for fp in fingerprints {
        let Some(shared) = dispatcher.subscriptions.borrow().get(&fp) else {
            continue;
        };
        let generation = shared.borrow_mut().next_generation();
        let dispatcher = Rc::clone(dispatcher);
        let sockets = sockets.clone();
        tokio::task::spawn_local(async move {
            reevaluate_and_notify(&dispatcher, &sockets, &fp, generation).await;
        });
    }
}

async fn reevaluate_and_notify(
    dispatcher: &Rc<RequestDispatcher>,
    sockets: &Sockets,
    fp: &str,
    generation: u64,
) {
    let Some(shared) = dispatcher.subscriptions.borrow().get(fp) else {
        return;
    };
    let Some((new_result, seq, observers)) =
        reevaluate_shared(&shared, dispatcher.backend.as_ref(), generation).await
    else {
        return;
    };
    // The subscription may have lost its last observer while this
    // re-evaluation's backend query was in flight; discard stale results
    // rather than notifying observers of a resource that no longer exists
    // (§5's cancellation rule).
    if !dispatcher.subscriptions.borrow().contains(fp) {
        debug!("discarding stale re-evaluation for torn-down subscription {}", fp);
        return;
    }

    let payload = dispatcher.prefixes.borrow().shorten(&new_result);
    for observer in observers {
        let socket = sockets.for_addr(&observer.addr);
        send_notification(&socket, &observer, seq, &payload).await;
    }
}

async fn send_notification(socket: &UdpSocket, observer: &ObserverEntry, seq: u32, payload: &[u8]) {
    let mut packet = Packet::new();
    packet.header.set_version(1);
    packet.header.set_type(MessageType::NonConfirmable);
    packet.header.set_code("2.05");
    packet.set_token(observer.token.clone());
    packet.payload = payload.to_vec();

    let mut observe_values = LinkedList::new();
    observe_values.push_back(encode_uint_option(seq));
    packet.set_option(CoapOption::Observe, observe_values);

    match packet.to_bytes() {
        Ok(encoded) => {
            if let Err(e) = socket.send_to(&encoded, observer.addr).await {
                warn!("failed to notify {}: {}", observer.identity, e);
            }
        }
        Err(e) => warn!("failed to encode notification for {}: {:?}", observer.identity, e),
    }
}

fn to_incoming_request(request: &CoapRequest<SocketAddr>, peer: SocketAddr) -> Option<IncomingRequest> {
    let method = match request.get_method() {
        RequestType::Get => Method::Get,
        RequestType::Post => Method::Post,
        RequestType::Delete => Method::Delete,
        _ => return None,
    };

    let path: Vec<String> = request
        .message
        .get_option(CoapOption::UriPath)
        .map(|segments| {
            segments
                .iter()
                .map(|seg| String::from_utf8_lossy(seg).into_owned())
                .collect()
        })
        .unwrap_or_default();

    // A `format=<x>` Uri-Query option is how the original CIMIL/MUSEPA
    // implementation's non-SPARQL update bodies select their format
    // (`musepa.py`'s "string option" scan); CoAP's Uri-Query option is the
    // standard carrier for `key=value` query strings, so we read it there
    // rather than inventing a private option number (§4.5).
    let format_option = request.message.get_option(CoapOption::UriQuery).and_then(|values| {
        values
            .iter()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .find(|v| v.starts_with("format="))
    });

    let observe = request
        .message
        .get_option(CoapOption::Observe)
        .and_then(|values| values.iter().next())
        .map(|bytes| decode_uint_option(bytes));

    Some(IncomingRequest {
        method,
        path,
        payload: request.message.payload.clone(),
        observe,
        format_option,
        token: request.message.get_token().clone(),
        source: peer,
    })
}

fn apply_response(coap_response: &mut CoapResponse, response: &OutgoingResponse) {
    coap_response.set_status(response.status);
    coap_response.message.payload = response.payload.clone();
    if let Some(seq) = response.observe {
        let mut values = LinkedList::new();
        values.push_back(encode_uint_option(seq));
        coap_response.message.set_option(CoapOption::Observe, values);
    }
}

/// CoAP uint options are encoded as the minimal big-endian byte sequence
/// (RFC 7252 §3.2); `0` is the empty sequence.
fn encode_uint_option(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first_nonzero = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    bytes[first_nonzero..].to_vec()
}

fn decode_uint_option(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32)
}
