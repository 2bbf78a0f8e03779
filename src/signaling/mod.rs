//! The rendezvous stage: a short-lived WebSocket channel that exchanges the
//! session descriptor and connectivity candidates, producing a ready
//! [`Transport`]. The channel is torn down as soon as the media transport is
//! established; all further communication rides the tunnel itself.

mod message;
mod server;

pub use message::{generate_pin, SignalMessage};

use std::{
    fmt,
    io::{self, Error, ErrorKind},
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    sync::Arc,
};

use base64::Engine;
use futures_util::{Sink, SinkExt, StreamExt};
use quinn::{Connection, Endpoint};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    endpoint::{make_client_endpoint, make_server_endpoint, SERVER_NAME},
    transport::Transport,
};
use server::SignalServer;

/// Runs the host side of the rendezvous: serve the signaling channel, hand
/// the peer the session descriptor and candidates, and wait for the media
/// transport to arrive. Returns the endpoint (which must outlive the session)
/// and the ready transport.
pub async fn establish_as_host(token: &CancellationToken, ws_addr: SocketAddr) -> io::Result<(Endpoint, Arc<Transport>)> {
    let udp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    let udp_port = udp.local_addr()?.port();
    let (quic, cert_der) = make_server_endpoint(udp)?;

    let pin = generate_pin();
    let server = SignalServer::bind(ws_addr, pin.clone()).await?;
    let ws_port = server.local_addr()?.port();

    print_invite(ws_addr.ip(), ws_port, &pin);
    info!("waiting for a peer to connect");

    let (mut ws, dialed_addr) = server.wait_for_peer(token).await?;
    debug!("signaling peer connected, sending session descriptor");

    let offer = SignalMessage::Offer {
        certificate: base64::engine::general_purpose::STANDARD.encode(&cert_der),
    };
    send_message(&mut ws, &offer).await?;

    for address in gather_candidates(dialed_addr.ip(), udp_port) {
        debug!("advertising candidate {address}");
        send_message(&mut ws, &SignalMessage::Candidate { address }).await?;
    }

    // Wait for the media transport; keep consuming the signaling channel so
    // the peer's answer gets logged. The peer closing the channel early is
    // benign — it does so right after its side of the transport comes up.
    let mut ws_open = true;
    let conn: Connection = loop {
        tokio::select! {
            maybe_connecting = quic.accept() => {
                let connecting = match maybe_connecting {
                    Some(connecting) => connecting,
                    None => return Err(Error::new(ErrorKind::Other, "endpoint closed while waiting for the peer")),
                };
                match connecting.await {
                    Ok(conn) => break conn,
                    Err(error) => warn!("incoming connection failed: {error}"),
                }
            }
            maybe_msg = ws.next(), if ws_open => match maybe_msg {
                Some(Ok(msg)) => {
                    if let Some(SignalMessage::Answer { address }) = parse_message(&msg) {
                        debug!("peer selected candidate {address}");
                    }
                }
                Some(Err(error)) => {
                    debug!("signaling channel error: {error}");
                    ws_open = false;
                }
                None => {
                    debug!("signaling channel closed by peer");
                    ws_open = false;
                }
            },
            _ = token.cancelled() => return Err(cancelled()),
        }
    };

    let _ = ws.close(None).await;
    info!("transport channel established with {}", conn.remote_address());
    Ok((quic, Transport::new(conn, token)))
}

/// Runs the client side of the rendezvous: dial the signaling URL, consume
/// the offer, race one QUIC dial per received candidate, and report the
/// winner back. Returns the endpoint and the ready transport.
pub async fn establish_as_client(token: &CancellationToken, ws_url: &str) -> io::Result<(Endpoint, Arc<Transport>)> {
    info!("connecting to host at {ws_url}");
    let (mut ws, _response) = tokio::select! {
        result = connect_async(ws_url) => result.map_err(|error| {
            Error::new(ErrorKind::ConnectionRefused, format!("failed to reach the signaling server: {error}"))
        })?,
        _ = token.cancelled() => return Err(cancelled()),
    };

    // The first signaling message must be the offer.
    let certificate = loop {
        let msg = tokio::select! {
            maybe_msg = ws.next() => match maybe_msg {
                Some(Ok(msg)) => msg,
                Some(Err(error)) => return Err(Error::new(ErrorKind::Other, format!("signaling read error: {error}"))),
                None => return Err(Error::new(ErrorKind::UnexpectedEof, "signaling channel closed before the offer")),
            },
            _ = token.cancelled() => return Err(cancelled()),
        };

        match parse_message(&msg) {
            Some(SignalMessage::Offer { certificate }) => break certificate,
            Some(other) => {
                return Err(Error::new(ErrorKind::InvalidData, format!("expected an offer, got {other:?}")));
            }
            // Pings and malformed frames.
            None => continue,
        }
    };

    let cert_der = base64::engine::general_purpose::STANDARD
        .decode(certificate.as_bytes())
        .map_err(|error| Error::new(ErrorKind::InvalidData, format!("offer carried an invalid certificate: {error}")))?;

    let udp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    let quic = make_client_endpoint(udp, cert_der)?;

    // Race one dial per candidate as they trickle in; the first established
    // connection wins.
    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<Option<(SocketAddr, Connection)>>();
    let mut attempts = 0usize;
    let mut ws_open = true;

    let (winner, conn) = loop {
        tokio::select! {
            maybe_result = result_rx.recv() => match maybe_result {
                Some(Some(pair)) => break pair,
                Some(None) => {
                    attempts -= 1;
                    if attempts == 0 && !ws_open {
                        return Err(Error::new(ErrorKind::ConnectionRefused, "none of the host's candidates were reachable"));
                    }
                }
                None => return Err(Error::new(ErrorKind::Other, "candidate race ended unexpectedly")),
            },
            maybe_msg = ws.next(), if ws_open => match maybe_msg {
                Some(Ok(msg)) => {
                    if let Some(SignalMessage::Candidate { address }) = parse_message(&msg) {
                        debug!("trying candidate {address}");
                        attempts += 1;
                        spawn_dial(&quic, address, result_tx.clone());
                    }
                }
                Some(Err(error)) => {
                    debug!("signaling channel error: {error}");
                    ws_open = false;
                    if attempts == 0 {
                        return Err(Error::new(
                            ErrorKind::UnexpectedEof,
                            "signaling channel ended before any candidate arrived",
                        ));
                    }
                }
                None => {
                    debug!("signaling channel closed by host");
                    ws_open = false;
                    if attempts == 0 {
                        return Err(Error::new(
                            ErrorKind::UnexpectedEof,
                            "signaling channel ended before any candidate arrived",
                        ));
                    }
                }
            },
            _ = token.cancelled() => return Err(cancelled()),
        }
    };

    // Best effort: the channel may already be gone.
    let _ = send_message(&mut ws, &SignalMessage::Answer { address: winner }).await;
    let _ = ws.close(None).await;

    info!("transport channel established with {}", conn.remote_address());
    Ok((quic, Transport::new(conn, token)))
}

fn spawn_dial(quic: &Endpoint, address: SocketAddr, result_tx: mpsc::UnboundedSender<Option<(SocketAddr, Connection)>>) {
    let quic = quic.clone();
    tokio::spawn(async move {
        let connecting = match quic.connect(address, SERVER_NAME) {
            Ok(connecting) => connecting,
            Err(error) => {
                warn!("cannot dial candidate {address}: {error}");
                let _ = result_tx.send(None);
                return;
            }
        };

        match connecting.await {
            Ok(conn) => {
                let _ = result_tx.send(Some((address, conn)));
            }
            Err(error) => {
                warn!("candidate {address} failed: {error}");
                let _ = result_tx.send(None);
            }
        }
    });
}

/// Prints the invitation the host operator shares with the peer.
fn print_invite(bind_ip: IpAddr, ws_port: u16, pin: &str) {
    let display_ip = match bind_ip.is_unspecified() {
        false => bind_ip,
        true => default_route_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
    };

    println!();
    println!("  Signaling URL: ws://{display_ip}:{ws_port}/ws?pin={pin}");
    println!("  Run on the other machine:");
    println!("    burrow -role client -port <local port> -wsUrl \"ws://{display_ip}:{ws_port}/ws?pin={pin}\"");
    println!();
}

/// Deduplicated addresses the peer should try for the media transport: the
/// address it already dialed for signaling, the default-route interface, and
/// loopback for same-host sessions.
fn gather_candidates(dialed_ip: IpAddr, udp_port: u16) -> Vec<SocketAddr> {
    let mut candidates: Vec<SocketAddr> = Vec::new();

    let mut push = |ip: IpAddr| {
        let address = SocketAddr::new(ip, udp_port);
        if !candidates.contains(&address) {
            candidates.push(address);
        }
    };

    push(dialed_ip);
    if let Some(ip) = default_route_ip() {
        push(ip);
    }
    push(IpAddr::V4(Ipv4Addr::LOCALHOST));

    candidates
}

/// Learns the default-route interface address by "connecting" a UDP socket to
/// a public address. No traffic is actually sent.
fn default_route_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(("8.8.8.8", 53)).ok()?;
    Some(socket.local_addr().ok()?.ip())
}

async fn send_message<S>(ws: &mut S, msg: &SignalMessage) -> io::Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let text = serde_json::to_string(msg)
        .map_err(|error| Error::new(ErrorKind::InvalidData, format!("failed to encode signaling message: {error}")))?;

    ws.send(Message::Text(text))
        .await
        .map_err(|error| Error::new(ErrorKind::BrokenPipe, format!("signaling send failed: {error}")))
}

fn parse_message(msg: &Message) -> Option<SignalMessage> {
    match msg {
        Message::Text(text) => match serde_json::from_str(text) {
            Ok(parsed) => Some(parsed),
            Err(error) => {
                warn!("ignoring a malformed signaling message: {error}");
                None
            }
        },
        _ => None,
    }
}

fn cancelled() -> Error {
    Error::new(ErrorKind::Interrupted, "cancelled during signaling")
}
