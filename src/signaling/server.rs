use std::{io, net::SocketAddr};

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
    },
    WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The WebSocket stream handed out by the host-side signaling server.
pub type WsStream = WebSocketStream<TcpStream>;

/// Host-side signaling server: hands out the first WebSocket peer that
/// upgrades on `/ws` with the correct `pin` query parameter.
pub struct SignalServer {
    listener: TcpListener,
    pin: String,
}

impl SignalServer {
    pub async fn bind(addr: SocketAddr, pin: String) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|error| {
            io::Error::new(error.kind(), format!("failed to start signaling server on {addr}: {error}"))
        })?;

        Ok(Self { listener, pin })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Waits for the first peer presenting the correct PIN. Returns the
    /// upgraded stream and the local address the peer dialed (which becomes
    /// the primary connectivity candidate for the media transport).
    pub async fn wait_for_peer(&self, token: &CancellationToken) -> io::Result<(WsStream, SocketAddr)> {
        loop {
            let (stream, peer_addr) = tokio::select! {
                result = self.listener.accept() => result?,
                _ = token.cancelled() => {
                    return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled while waiting for a peer"));
                }
            };

            let dialed_addr = stream.local_addr()?;
            let pin = self.pin.clone();

            let upgrade = accept_hdr_async(stream, move |request: &Request, response: Response| {
                match request_is_authorized(request, &pin) {
                    true => Ok(response),
                    false => {
                        let mut rejection = ErrorResponse::new(Some("invalid PIN".to_string()));
                        *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                        Err(rejection)
                    }
                }
            });

            match upgrade.await {
                Ok(ws) => {
                    debug!("signaling peer connected from {peer_addr}");
                    return Ok((ws, dialed_addr));
                }
                Err(error) => {
                    warn!("rejected signaling peer {peer_addr}: {error}");
                    continue;
                }
            }
        }
    }
}

/// The upgrade must target `/ws` and carry a matching `pin` query parameter.
fn request_is_authorized(request: &Request, pin: &str) -> bool {
    if request.uri().path() != "/ws" {
        return false;
    }

    let query = match request.uri().query() {
        Some(query) => query,
        None => return false,
    };

    query.split('&').any(|pair| pair.strip_prefix("pin=") == Some(pin))
}
