//! udp_tx.rs — UDP publisher for relay datagrams
//!
//! Sends one `{timestamp, markers}` datagram per epoch to the bridge relay
//! (127.0.0.1:12345 by default) and waits up to 100 ms for its `ACK`.
//! Epochs without visible markers go out as heartbeats (empty `markers`)
//! so the relay's liveness stays up.
//!
//! Send errors and missing ACKs are logged, never fatal.

use std::net::SocketAddr;
use std::time::Duration;

use marker_types::{RelayDatagram, RELAY_ACK};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const ACK_TIMEOUT: Duration = Duration::from_millis(100);

pub struct UdpPublisher {
    socket: UdpSocket,
    relay_addr: SocketAddr,
    ack_timeout: Duration,
    connected: bool,
    attempts: u64,
}

impl UdpPublisher {
    pub async fn new(relay_addr: SocketAddr) -> Result<Self, std::io::Error> {
        let bind = if relay_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        Ok(Self { socket, relay_addr, ack_timeout: ACK_TIMEOUT, connected: false, attempts: 0 })
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Datagrams sent without an ACK since start.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Send one datagram; true when the relay acknowledged it.
    pub async fn send(&mut self, datagram: &RelayDatagram) -> bool {
        let bytes = match serde_json::to_vec(datagram) {
            Ok(b) => b,
            Err(e) => {
                warn!("UDP: serialize failed: {e}");
                return false;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, self.relay_addr).await {
            warn!("UDP: send to {} failed: {e}", self.relay_addr);
            self.connected = false;
            return false;
        }
        debug!("UDP → {} ({} bytes)", self.relay_addr, bytes.len());

        let mut buf = [0u8; 64];
        match timeout(self.ack_timeout, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((n, _))) if &buf[..n] == RELAY_ACK => {
                if !self.connected {
                    info!("✅ Relay at {} acknowledged, connected", self.relay_addr);
                    self.connected = true;
                }
                true
            }
            Ok(Ok(_)) => {
                debug!("UDP: unexpected reply from relay");
                false
            }
            Ok(Err(e)) => {
                // ICMP port unreachable surfaces here on Linux
                debug!("UDP: recv failed: {e}");
                self.miss();
                false
            }
            Err(_) => {
                self.miss();
                false
            }
        }
    }

    pub async fn send_heartbeat(&mut self, timestamp: f64) -> bool {
        self.send(&RelayDatagram::heartbeat(timestamp)).await
    }

    fn miss(&mut self) {
        self.attempts += 1;
        if self.connected {
            warn!("Relay at {} stopped acknowledging", self.relay_addr);
            self.connected = false;
        }
        if self.attempts % 10 == 0 {
            info!("No response from relay. Attempt {}", self.attempts);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ack_marks_connected() {
        let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = relay.local_addr().unwrap();
        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (n, src) = relay.recv_from(&mut buf).await.unwrap();
            relay.send_to(RELAY_ACK, src).await.unwrap();
            serde_json::from_slice::<RelayDatagram>(&buf[..n]).unwrap()
        });

        let mut tx = UdpPublisher::new(addr).await.unwrap().with_ack_timeout(Duration::from_secs(2));
        assert!(tx.send_heartbeat(3.25).await);
        assert!(tx.is_connected());
        let got = echo.await.unwrap();
        assert!(got.is_heartbeat());
        assert_eq!(got.timestamp, 3.25);
    }

    #[tokio::test]
    async fn silence_counts_attempts() {
        let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = relay.local_addr().unwrap();
        let mut tx = UdpPublisher::new(addr).await.unwrap().with_ack_timeout(Duration::from_millis(20));
        assert!(!tx.send_heartbeat(0.0).await);
        assert!(!tx.send_heartbeat(0.0).await);
        assert_eq!(tx.attempts(), 2);
        assert!(!tx.is_connected());
        drop(relay);
    }
}
