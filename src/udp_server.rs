//! UDP RPC transport: one socket, one [`UdpSession`] per remote address.

use crate::rpc::RpcRequest;
use crate::shelly_device::ShellyDevice;
use crate::udp_session::{reply_parse_error, OutboundDatagram, UdpSession};
use anyhow::Context;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const MAX_DATAGRAM_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy)]
pub struct UdpServerSettings {
    pub throttling_interval: Duration,
    pub idle_timeout: Duration,
    pub outbound_queue_size: usize,
    /// Upper bound on concurrently tracked peers.
    pub max_sessions: usize,
}

pub struct UdpServer {
    socket: Arc<UdpSocket>,
    device: Arc<ShellyDevice>,
    settings: UdpServerSettings,
    sessions: HashMap<SocketAddr, UdpSession>,
    cancel: CancellationToken,
}

impl UdpServer {
    pub async fn bind(
        address: &str,
        device: Arc<ShellyDevice>,
        settings: UdpServerSettings,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(address)
            .await
            .with_context(|| format!("binding udp socket {address}"))?;
        Ok(Self {
            socket: Arc::new(socket),
            device,
            settings,
            sessions: HashMap::new(),
            cancel,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Runs until the cancellation token fires or the socket fails.
    pub async fn run(mut self) -> anyhow::Result<()> {
        tracing::info!(address = %self.local_addr()?, "udp rpc server listening");

        let (outbound_tx, outbound_rx) = mpsc::channel(self.settings.outbound_queue_size.max(1));
        let sender = tokio::spawn(send_loop(
            Arc::clone(&self.socket),
            outbound_rx,
            self.cancel.clone(),
        ));

        let reap_every = (self.settings.idle_timeout / 2).max(Duration::from_secs(1));
        let mut reaper = interval(reap_every);
        reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                _ = reaper.tick() => self.reap_idle_sessions(Instant::now()),
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((len, remote)) => self.on_datagram(remote, &buffer[..len], &outbound_tx),
                    Err(e) => {
                        // Windows reports ICMP port unreachable on the next recv
                        if e.kind() == std::io::ErrorKind::ConnectionReset {
                            tracing::debug!(error = %e, "udp recv reset");
                            continue;
                        }
                        break Err(anyhow::Error::new(e).context("udp receive failed"));
                    }
                },
            }
        };

        for session in self.sessions.values() {
            session.close();
        }
        self.sessions.clear();
        drop(outbound_tx);
        self.cancel.cancel();
        let _ = sender.await;
        tracing::info!("udp rpc server stopped");
        result
    }

    /// Routes a datagram to its peer's session. A session is only created
    /// for a sender whose first datagram decodes as a request.
    fn on_datagram(&mut self, remote: SocketAddr, payload: &[u8], outbound: &Sender<OutboundDatagram>) {
        if let Some(session) = self.sessions.get_mut(&remote) {
            session.on_datagram(payload);
            return;
        }

        if let Err(e) = RpcRequest::decode(payload) {
            tracing::debug!(%remote, error = %e, len = payload.len(), "undecodable datagram from new peer");
            reply_parse_error(&self.device, outbound, remote);
            return;
        }

        self.make_room(Instant::now());
        let session = self.sessions.entry(remote).or_insert_with(|| {
            UdpSession::new(
                remote,
                Arc::clone(&self.device),
                outbound.clone(),
                self.cancel.child_token(),
                self.settings.throttling_interval,
            )
        });
        session.on_datagram(payload);
    }

    /// Frees a slot when the table is full: idle sessions go first, then the
    /// least recently seen one.
    fn make_room(&mut self, now: Instant) {
        let limit = self.settings.max_sessions.max(1);
        if self.sessions.len() < limit {
            return;
        }
        self.reap_idle_sessions(now);
        while self.sessions.len() >= limit {
            let Some(oldest) = self
                .sessions
                .iter()
                .min_by_key(|(_, session)| session.last_seen())
                .map(|(remote, _)| *remote)
            else {
                break;
            };
            if let Some(session) = self.sessions.remove(&oldest) {
                tracing::debug!(remote = %oldest, "udp session table full, evicting oldest peer");
                session.close();
            }
        }
    }

    fn reap_idle_sessions(&mut self, now: Instant) {
        let timeout = self.settings.idle_timeout;
        self.sessions.retain(|remote, session| {
            let keep = !session.is_idle(now, timeout);
            if !keep {
                tracing::debug!(%remote, "evicting idle udp session");
                session.close();
            }
            keep
        });
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    mut outbound: Receiver<OutboundDatagram>,
    cancel: CancellationToken,
) {
    loop {
        let datagram = tokio::select! {
            _ = cancel.cancelled() => break,
            datagram = outbound.recv() => match datagram {
                Some(datagram) => datagram,
                None => break,
            },
        };
        if let Err(e) = socket.send_to(&datagram.payload, datagram.target).await {
            tracing::warn!(target = %datagram.target, error = %e, "udp send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientContextConfig, Config};
    use crate::readings::PowerReadings;
    use serde_json::Value;
    use tokio::sync::watch;
    use tokio::time::timeout;

    fn device() -> Arc<ShellyDevice> {
        let mut config = Config::default();
        config.client_contexts = vec![ClientContextConfig {
            address: "127.0.0.1".to_string(),
            mac: Some("AABBCCDDEEFF".to_string()),
            ..Default::default()
        }];
        let (_tx, rx) = watch::channel(PowerReadings::default());
        Arc::new(ShellyDevice::new(&config, rx))
    }

    fn settings() -> UdpServerSettings {
        UdpServerSettings {
            throttling_interval: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(60),
            outbound_queue_size: 8,
            max_sessions: 16,
        }
    }

    async fn recv_json(socket: &UdpSocket) -> Value {
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buffer))
            .await
            .expect("reply within timeout")
            .unwrap();
        serde_json::from_slice(&buffer[..len]).unwrap()
    }

    #[tokio::test]
    async fn test_udp_round_trip() {
        let cancel = CancellationToken::new();
        let server = UdpServer::bind("127.0.0.1:0", device(), settings(), cancel.clone())
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();
        let handle = tokio::spawn(server.run());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(br#"{"id":1,"method":"Shelly.GetDeviceInfo"}"#, server_addr)
            .await
            .unwrap();
        let reply = recv_json(&client).await;
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["result"]["mac"], "AABBCCDDEEFF");

        client
            .send_to(br#"{"id":2,"method":"EM.GetStatus"}"#, server_addr)
            .await
            .unwrap();
        client
            .send_to(br#"{"id":3,"method":"EM.GetStatus"}"#, server_addr)
            .await
            .unwrap();
        let reply = recv_json(&client).await;
        assert_eq!(reply["id"], 3);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reaper_evicts_idle_sessions() {
        let cancel = CancellationToken::new();
        let mut server = UdpServer::bind("127.0.0.1:0", device(), settings(), cancel.clone())
            .await
            .unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let remote: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        server.sessions.insert(
            remote,
            UdpSession::new(
                remote,
                Arc::clone(&server.device),
                tx,
                cancel.child_token(),
                settings().throttling_interval,
            ),
        );

        server.reap_idle_sessions(Instant::now());
        assert_eq!(server.sessions.len(), 1);

        server.reap_idle_sessions(Instant::now() + Duration::from_secs(61));
        assert!(server.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_garbage_from_new_peer_gets_parse_error_without_session() {
        let cancel = CancellationToken::new();
        let mut server = UdpServer::bind("127.0.0.1:0", device(), settings(), cancel.clone())
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let remote: SocketAddr = "127.0.0.1:5001".parse().unwrap();

        server.on_datagram(remote, b"\x00\x01 not json", &tx);

        assert!(server.sessions.is_empty());
        let reply = rx.try_recv().expect("parse error reply");
        assert_eq!(reply.target, remote);
        let value: Value = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(value["error"]["code"], -32700);

        server.on_datagram(remote, br#"{"id":1,"method":"Shelly.GetConfig"}"#, &tx);
        assert_eq!(server.sessions.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_table_evicts_least_recently_seen() {
        let cancel = CancellationToken::new();
        let limited = UdpServerSettings {
            max_sessions: 2,
            ..settings()
        };
        let mut server = UdpServer::bind("127.0.0.1:0", device(), limited, cancel.clone())
            .await
            .unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let request = br#"{"id":1,"method":"Shelly.GetConfig"}"#;
        let peers: Vec<SocketAddr> = (6000..6003)
            .map(|port| SocketAddr::from(([127, 0, 0, 1], port)))
            .collect();

        server.on_datagram(peers[0], request, &tx);
        tokio::time::advance(Duration::from_secs(1)).await;
        server.on_datagram(peers[1], request, &tx);
        tokio::time::advance(Duration::from_secs(1)).await;
        server.on_datagram(peers[0], request, &tx);
        server.on_datagram(peers[2], request, &tx);

        assert_eq!(server.sessions.len(), 2);
        assert!(server.sessions.contains_key(&peers[0]));
        assert!(!server.sessions.contains_key(&peers[1]));
        assert!(server.sessions.contains_key(&peers[2]));
    }
}
