//! Per-connection state of a WebSocket RPC client.

use crate::error::{Error, Result};
use crate::rpc::{Frame, Framing, ResponseFrame, RpcRequest};
use crate::shelly_device::ShellyDevice;
use crate::throttle::ThrottledDispatchQueue;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

/// Status request waiting in the throttling queue, plus the framing the
/// client used so the eventual response matches it.
#[derive(Debug, Clone)]
pub struct PendingStatusRequest {
    pub request: RpcRequest,
    pub framing: Framing,
}

/// Lives as long as the WebSocket connection. Only the connection's read
/// loop touches it; throttled replies go out from the queue's own task.
pub struct WebsocketSession {
    remote: SocketAddr,
    device: Arc<ShellyDevice>,
    outbound: Sender<Frame>,
    cancel: CancellationToken,
    throttle: ThrottledDispatchQueue<PendingStatusRequest>,
    last_status_request: Option<RpcRequest>,
}

impl WebsocketSession {
    /// `cancel` is the connection's cancellation handle; firing it must stop
    /// the transport loops. The throttling queue runs on a child of it.
    pub fn new(
        remote: SocketAddr,
        device: Arc<ShellyDevice>,
        outbound: Sender<Frame>,
        cancel: CancellationToken,
        throttling_interval: Duration,
    ) -> Self {
        let throttle = {
            let device = Arc::clone(&device);
            let outbound = outbound.clone();
            ThrottledDispatchQueue::spawn(
                throttling_interval,
                cancel.child_token(),
                move |pending: PendingStatusRequest| {
                    let response = device.dispatch(remote.ip(), &pending.request);
                    if let Err(e) = send_response(&outbound, &response, pending.framing) {
                        log_send_failure(remote, &e);
                    }
                },
            )
        };

        tracing::debug!(%remote, "websocket session opened");
        Self {
            remote,
            device,
            outbound,
            cancel,
            throttle,
            last_status_request: None,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn last_status_request(&self) -> Option<&RpcRequest> {
        self.last_status_request.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Handles one inbound data frame. Status polls are throttled, anything
    /// else is answered right away in the frame's own encoding.
    pub fn on_inbound_frame(&mut self, frame: Frame) {
        if self.is_closed() {
            return;
        }
        let framing = frame.framing();

        let request = match RpcRequest::decode(frame.as_bytes()) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(remote = %self.remote, error = %e, "undecodable websocket frame");
                let response = self.device.parse_error(self.remote.ip());
                self.reply(&response, framing);
                return;
            }
        };

        if request.is_status_poll() {
            self.handle_status_request(framing, request);
        } else {
            let response = self.device.dispatch(self.remote.ip(), &request);
            self.reply(&response, framing);
        }
    }

    pub fn handle_status_request(&mut self, framing: Framing, request: RpcRequest) {
        self.last_status_request = Some(request.clone());
        self.throttle
            .offer(PendingStatusRequest { request, framing });
    }

    /// Fires the cancellation handle, which ends the connection loops and the
    /// throttling queue.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(remote = %self.remote, "websocket session closed");
        }
        self.throttle.close();
        self.cancel.cancel();
    }

    fn reply(&self, response: &ResponseFrame, framing: Framing) {
        if let Err(e) = send_response(&self.outbound, response, framing) {
            log_send_failure(self.remote, &e);
        }
    }
}

impl Drop for WebsocketSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn send_response(outbound: &Sender<Frame>, response: &ResponseFrame, framing: Framing) -> Result<()> {
    let frame = response.encode(framing)?;
    outbound.try_send(frame)?;
    Ok(())
}

fn log_send_failure(remote: SocketAddr, error: &Error) {
    match error {
        Error::SessionClosed => tracing::trace!(%remote, "response dropped, session closing"),
        Error::OutboundFull => tracing::warn!(%remote, "outbound queue full, response dropped"),
        Error::MalformedFrame(e) => tracing::error!(%remote, error = %e, "failed to encode response"),
    }
}
