//! The post-transport tunnel core: packet dispatch, per-socket lifecycle
//! management, and TCP bridging for the host and client roles.
//!
//! Host and client run the same socket machinery; the only difference is how
//! the local TCP endpoint is obtained. The host dials its target on the first
//! CONNECT for a new socket id; the client creates sockets from connections
//! accepted by its virtual service listener.

mod reassembler;
mod seq;
mod socket;
mod socket_id;

pub use socket_id::socket_id_from_port;

use std::{collections::HashMap, future::Future, io, net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    protocol::{Packet, PacketKind},
    stats,
};
use socket::Socket;

/// The message channel the tunnel core runs over: typed packet submission
/// (serialized internally by a single writer), inbound packet callback, and
/// a session-scoped cancellation token. Implemented by the QUIC transport
/// wrapper and by the in-process test transport.
pub trait Transport: Send + Sync + 'static {
    /// Enqueues a CONNECT packet. Safe to call from any task.
    fn send_connect(&self, socket_id: u32, seq_num: u32) -> impl Future<Output = ()> + Send;

    /// Enqueues a DATA packet with the given payload. Safe to call from any task.
    fn send_data(&self, socket_id: u32, seq_num: u32, payload: Vec<u8>) -> impl Future<Output = ()> + Send;

    /// Enqueues a CLOSE packet. Safe to call from any task.
    fn send_close(&self, socket_id: u32, seq_num: u32) -> impl Future<Output = ()> + Send;

    /// Registers the callback invoked for every inbound packet.
    fn on_packet(&self, handler: Arc<dyn Fn(Packet) + Send + Sync>);

    /// Returns the session token, cancelled when the transport has closed or
    /// failed.
    fn done(&self) -> CancellationToken;
}

/// Socket id → socket route table with automatic entry removal.
struct Adapter<T> {
    routes: Mutex<HashMap<u32, Arc<Socket<T>>>>,
}

impl<T: Transport> Adapter<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
        })
    }

    /// Adds a socket to the route table and starts the waiter that removes
    /// the entry once the socket's token fires. The waiter is the only path
    /// that removes entries.
    fn register(self: &Arc<Self>, socket: &Arc<Socket<T>>) {
        self.routes.lock().insert(socket.id(), Arc::clone(socket));
        self.watch_for_removal(socket);
    }

    /// Returns the socket for an id, creating and registering one with
    /// `create` when absent. Lookup and insert happen under one lock, so
    /// concurrent packets for a brand-new id cannot race two sockets into
    /// existence.
    fn route_or_register(self: &Arc<Self>, socket_id: u32, create: impl FnOnce() -> Arc<Socket<T>>) -> Arc<Socket<T>> {
        let socket = {
            let mut routes = self.routes.lock();
            if let Some(socket) = routes.get(&socket_id) {
                return Arc::clone(socket);
            }
            let socket = create();
            routes.insert(socket_id, Arc::clone(&socket));
            socket
        };

        self.watch_for_removal(&socket);
        socket
    }

    /// Looks up the socket for an id.
    fn route(&self, socket_id: u32) -> Option<Arc<Socket<T>>> {
        self.routes.lock().get(&socket_id).map(Arc::clone)
    }

    fn watch_for_removal(self: &Arc<Self>, socket: &Arc<Socket<T>>) {
        stats::global().add_conn();

        let adapter = Arc::clone(self);
        let token = socket.token().clone();
        let id = socket.id();
        tokio::spawn(async move {
            token.cancelled().await;
            adapter.routes.lock().remove(&id);
        });
    }
}

/// Runs the host side of the tunnel over an established transport: inbound
/// packets for unknown socket ids (other than stale CLOSEs) create a socket
/// that dials `target_addr`. Blocks until the transport is done.
pub async fn run_as_host<T: Transport>(tr: Arc<T>, target_addr: SocketAddr) -> io::Result<()> {
    let done = tr.done();
    let adapter = Adapter::new();

    {
        let adapter = Arc::clone(&adapter);
        let handler_tr = Arc::clone(&tr);
        let parent = done.clone();

        tr.on_packet(Arc::new(move |pkt: Packet| {
            let socket = match adapter.route(pkt.socket_id) {
                Some(socket) => socket,
                None => {
                    // Unknown socket id: create a socket, unless this is a
                    // stale CLOSE for a connection already gone.
                    if pkt.kind == PacketKind::Close {
                        return;
                    }

                    adapter.route_or_register(pkt.socket_id, || {
                        let (socket, inbox_rx) = Socket::new(&parent, pkt.socket_id, Arc::clone(&handler_tr));
                        tokio::spawn(Arc::clone(&socket).run_host(inbox_rx, target_addr));
                        socket
                    })
                }
            };

            let id = pkt.socket_id;
            if !socket.offer(pkt) {
                warn!("[{id:08x}] inbox full, dropping packet");
            }
        }));
    }

    done.cancelled().await;
    Ok(())
}

/// Runs the client side of the tunnel over an established transport: a
/// virtual service listens on `listen_addr`, and every accepted connection
/// becomes a socket announced to the host with CONNECT. Inbound packets for
/// unknown socket ids are dropped. Blocks until the transport is done.
pub async fn run_as_client<T: Transport>(tr: Arc<T>, listen_addr: SocketAddr) -> io::Result<()> {
    let done = tr.done();
    let adapter = Adapter::new();

    {
        let adapter = Arc::clone(&adapter);
        tr.on_packet(Arc::new(move |pkt: Packet| {
            let socket = match adapter.route(pkt.socket_id) {
                Some(socket) => socket,
                None => {
                    // Only the accept loop creates client-side sockets.
                    debug!("[{:08x}] unknown socket id, dropping packet", pkt.socket_id);
                    return;
                }
            };

            let id = pkt.socket_id;
            if !socket.offer(pkt) {
                warn!("[{id:08x}] inbox full, dropping packet");
            }
        }));
    }

    let listener = TcpListener::bind(listen_addr).await.map_err(|error| {
        io::Error::new(error.kind(), format!("failed to listen on {listen_addr}: {error}"))
    })?;
    info!("virtual service listening on {listen_addr}");

    let accept_done = done.clone();
    let accept_tr = Arc::clone(&tr);
    let accept_adapter = Arc::clone(&adapter);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(pair) => pair,
                        Err(error) => {
                            if !accept_done.is_cancelled() {
                                warn!("accept error: {error}");
                            }
                            return;
                        }
                    };

                    let socket_id = socket_id_from_port(peer_addr.port());
                    debug!("[{socket_id:08x}] new connection from {peer_addr}");

                    let (socket, inbox_rx) = Socket::new(&accept_done, socket_id, Arc::clone(&accept_tr));
                    accept_adapter.register(&socket);
                    tokio::spawn(Arc::clone(&socket).run_client(inbox_rx, stream));
                }
                _ = accept_done.cancelled() => return,
            }
        }
    });

    done.cancelled().await;
    Ok(())
}
