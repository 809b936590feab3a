//! UDP ingress: decode datagrams, stamp arrival, hand off to the router.
//!
//! Faults here are never fatal to the daemon: an undecodable or malformed
//! datagram is dropped at debug level and the loop keeps receiving.

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::osc::{parse_packet, Inbound};
use crate::pipeline::WallClock;

pub struct OscIngress {
    socket: UdpSocket,
}

impl OscIngress {
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        info!(%addr, "ingress listening");
        Ok(Self { socket })
    }

    /// The locally bound address (resolves port 0 binds).
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive loop. Ends when the router side hangs up.
    pub async fn run(self, inbound_tx: mpsc::Sender<(Inbound, u64)>, clock: WallClock) {
        let mut buf = vec![0u8; rosc::decoder::MTU];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    warn!(%err, "ingress receive failed");
                    continue;
                }
            };
            let arrival_ms = clock.now_ms();

            match rosc::decoder::decode_udp(&buf[..len]) {
                Ok((_, packet)) => match parse_packet(packet) {
                    Ok(items) => {
                        for item in items {
                            if inbound_tx.send((item, arrival_ms)).await.is_err() {
                                info!("router closed; ingress shutting down");
                                return;
                            }
                        }
                    }
                    Err(err) => debug!(%peer, %err, "dropping malformed message"),
                },
                Err(err) => debug!(%peer, ?err, "dropping undecodable datagram"),
            }
        }
    }
}
