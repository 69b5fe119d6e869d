//! Per-peer state of a UDP RPC client, keyed by remote socket address.

use crate::error::{Error, Result};
use crate::rpc::{ResponseFrame, RpcRequest};
use crate::shelly_device::ShellyDevice;
use crate::throttle::ThrottledDispatchQueue;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A reply datagram for the socket's sender task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundDatagram {
    pub target: SocketAddr,
    pub payload: Vec<u8>,
}

pub struct UdpSession {
    remote: SocketAddr,
    device: Arc<ShellyDevice>,
    outbound: Sender<OutboundDatagram>,
    cancel: CancellationToken,
    throttle: ThrottledDispatchQueue<RpcRequest>,
    last_status_request: Option<RpcRequest>,
    last_status_request_time: Instant,
    last_seen: Instant,
}

impl UdpSession {
    pub fn new(
        remote: SocketAddr,
        device: Arc<ShellyDevice>,
        outbound: Sender<OutboundDatagram>,
        cancel: CancellationToken,
        throttling_interval: Duration,
    ) -> Self {
        let throttle = {
            let device = Arc::clone(&device);
            let outbound = outbound.clone();
            ThrottledDispatchQueue::spawn(
                throttling_interval,
                cancel.child_token(),
                move |request: RpcRequest| {
                    let response = device.dispatch(remote.ip(), &request);
                    if let Err(e) = send_datagram(&outbound, remote, &response) {
                        log_send_failure(remote, &e);
                    }
                },
            )
        };

        let now = Instant::now();
        tracing::debug!(%remote, "udp session opened");
        Self {
            remote,
            device,
            outbound,
            cancel,
            throttle,
            last_status_request: None,
            last_status_request_time: now,
            last_seen: now,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn last_status_request(&self) -> Option<&RpcRequest> {
        self.last_status_request.as_ref()
    }

    pub fn last_status_request_time(&self) -> Instant {
        self.last_status_request_time
    }

    /// Time of the most recent inbound datagram.
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Handles one inbound datagram. Datagrams that do not decode as an RPC
    /// request are answered with a parse error.
    pub fn on_datagram(&mut self, payload: &[u8]) {
        if self.is_closed() {
            return;
        }
        self.last_seen = Instant::now();

        let request = match RpcRequest::decode(payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(remote = %self.remote, error = %e, len = payload.len(), "undecodable datagram");
                reply_parse_error(&self.device, &self.outbound, self.remote);
                return;
            }
        };

        if request.is_status_poll() {
            self.handle_status_request(request);
        } else {
            let response = self.device.dispatch(self.remote.ip(), &request);
            if let Err(e) = send_datagram(&self.outbound, self.remote, &response) {
                log_send_failure(self.remote, &e);
            }
        }
    }

    pub fn handle_status_request(&mut self, request: RpcRequest) {
        let now = Instant::now();
        self.last_status_request = Some(request.clone());
        self.last_status_request_time = self.last_status_request_time.max(now);
        self.throttle.offer(request);
    }

    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(remote = %self.remote, "udp session closed");
        }
        self.throttle.close();
        self.cancel.cancel();
    }
}

impl Drop for UdpSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Answers an undecodable datagram. Also used by the server for senders
/// that have no session yet.
pub fn reply_parse_error(
    device: &ShellyDevice,
    outbound: &Sender<OutboundDatagram>,
    remote: SocketAddr,
) {
    let response = device.parse_error(remote.ip());
    if let Err(e) = send_datagram(outbound, remote, &response) {
        log_send_failure(remote, &e);
    }
}

fn send_datagram(
    outbound: &Sender<OutboundDatagram>,
    target: SocketAddr,
    response: &ResponseFrame,
) -> Result<()> {
    let payload = serde_json::to_vec(response)?;
    outbound.try_send(OutboundDatagram { target, payload })?;
    Ok(())
}

fn log_send_failure(remote: SocketAddr, error: &Error) {
    match error {
        Error::SessionClosed => tracing::trace!(%remote, "datagram dropped, server closing"),
        Error::OutboundFull => tracing::warn!(%remote, "udp send queue full, datagram dropped"),
        Error::MalformedFrame(e) => tracing::error!(%remote, error = %e, "failed to encode response"),
    }
}
