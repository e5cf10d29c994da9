//! # Transport Module
//!
//! [`RawTransport`] is the transport-shaped half of the plugin interface: a
//! multiplexing RPC client over one framed stream. It knows nothing about
//! plugin semantics; it correlates request ids with response envelopes,
//! enforces per-call deadlines, and reports connection loss. The rich,
//! domain-shaped half lives in [`crate::client::PluginClient`], an explicit
//! adapter over this type.
//!
//! ## Concurrency
//!
//! A transport owns two background tasks: a writer draining an outbound
//! queue and a reader dispatching response envelopes to pending oneshot
//! channels. Any number of callers may issue calls concurrently; responses
//! may arrive in any order. When the stream closes, every outstanding call
//! fails with `ConnectionClosed` and the closed flag flips, which the
//! supervisor's exit watcher observes as a crash signal.

use crate::codec::{FrameReader, FrameWriter};
use crate::error::TransportError;
use crate::wire::{RequestEnvelope, ResponseEnvelope};
use dashmap::DashMap;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};

type PendingMap = Arc<DashMap<u64, oneshot::Sender<Result<Value, TransportError>>>>;

/// Multiplexing RPC client over one framed byte stream.
#[derive(Debug)]
pub struct RawTransport {
    next_id: AtomicU64,
    pending: PendingMap,
    outbound: mpsc::Sender<Vec<u8>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    request_timeout: Duration,
}

impl RawTransport {
    /// Dial `addr` and stand up the reader and writer tasks.
    pub async fn connect(
        addr: SocketAddr,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream, request_timeout))
    }

    /// Build a transport over an already-established stream.
    ///
    /// Generic so tests can run both ends over an in-memory duplex pipe.
    pub fn from_stream<S>(stream: S, request_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let pending: PendingMap = Arc::new(DashMap::new());
        let (outbound, mut outbound_rx) = mpsc::channel::<Vec<u8>>(64);
        let (closed_tx, closed_rx) = watch::channel(false);

        // Writer task: drain the outbound queue until shutdown or I/O error.
        let writer_closed = closed_tx.clone();
        let mut writer_watch = closed_rx.clone();
        tokio::spawn(async move {
            let mut writer = FrameWriter::new(write_half);
            loop {
                tokio::select! {
                    _ = writer_watch.changed() => {
                        if *writer_watch.borrow() {
                            let _ = writer.shutdown().await;
                            break;
                        }
                    }
                    frame = outbound_rx.recv() => {
                        match frame {
                            Some(body) => {
                                if let Err(e) = writer.write_frame(&body).await {
                                    tracing::debug!("transport writer stopping: {e}");
                                    let _ = writer_closed.send(true);
                                    break;
                                }
                            }
                            None => {
                                let _ = writer.shutdown().await;
                                break;
                            }
                        }
                    }
                }
            }
        });

        // Reader task: dispatch response envelopes until EOF or error.
        let reader_pending = pending.clone();
        let reader_closed = closed_tx.clone();
        let mut reader_watch = closed_rx.clone();
        tokio::spawn(async move {
            let mut reader = FrameReader::new(read_half);
            loop {
                tokio::select! {
                    _ = reader_watch.changed() => {
                        if *reader_watch.borrow() {
                            break;
                        }
                    }
                    frame = reader.read_frame() => {
                        match frame {
                            Ok(Some(body)) => {
                                match serde_json::from_slice::<ResponseEnvelope>(&body) {
                                    Ok(envelope) => dispatch(&reader_pending, envelope),
                                    Err(e) => {
                                        tracing::warn!("discarding malformed response frame: {e}");
                                    }
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                tracing::debug!("transport reader stopping: {e}");
                                break;
                            }
                        }
                    }
                }
            }
            let _ = reader_closed.send(true);
            // Fail everything still waiting for a response.
            let stale: Vec<u64> = reader_pending.iter().map(|e| *e.key()).collect();
            for id in stale {
                if let Some((_, tx)) = reader_pending.remove(&id) {
                    let _ = tx.send(Err(TransportError::ConnectionClosed));
                }
            }
        });

        Self {
            next_id: AtomicU64::new(1),
            pending,
            outbound,
            closed_tx,
            closed_rx,
            request_timeout,
        }
    }

    /// Issue one call with the transport's default deadline.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        self.call_with_timeout(method, params, self.request_timeout)
            .await
    }

    /// Issue one call with an explicit deadline.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let envelope = RequestEnvelope {
            id,
            method: method.to_string(),
            params,
        };
        let body = serde_json::to_vec(&envelope)?;
        if self.outbound.send(body).await.is_err() {
            self.pending.remove(&id);
            return Err(TransportError::ConnectionClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&id);
                Err(TransportError::Timeout)
            }
        }
    }

    /// Whether the underlying stream is known to be gone.
    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Watch for the closed flag; used by the supervisor's exit watcher.
    pub fn closed_watch(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    /// Tear the transport down, failing all outstanding calls.
    pub fn shutdown(&self) {
        let _ = self.closed_tx.send(true);
    }
}

impl Drop for RawTransport {
    fn drop(&mut self) {
        let _ = self.closed_tx.send(true);
    }
}

fn dispatch(pending: &PendingMap, envelope: ResponseEnvelope) {
    let Some((_, tx)) = pending.remove(&envelope.id) else {
        // Late reply after a timeout already removed the waiter.
        tracing::trace!("dropping response for unknown call id {}", envelope.id);
        return;
    };
    let outcome = match (envelope.result, envelope.error) {
        (Some(value), None) => Ok(value),
        (None, Some(err)) => Err(TransportError::Remote {
            kind: err.kind,
            message: err.message,
        }),
        (Some(value), Some(_)) => Ok(value),
        (None, None) => Ok(Value::Null),
    };
    let _ = tx.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::kinds;
    use serde_json::json;

    /// Minimal in-process responder used to exercise the client half alone.
    async fn echo_server<S>(stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);
        while let Ok(Some(body)) = reader.read_frame().await {
            let req: RequestEnvelope = serde_json::from_slice(&body).unwrap();
            let resp = match req.method.as_str() {
                "echo" => ResponseEnvelope::ok(req.id, req.params),
                "sleep" => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    ResponseEnvelope::ok(req.id, Value::Null)
                }
                "fail" => ResponseEnvelope::err(req.id, kinds::INTERNAL, "boom"),
                _ => ResponseEnvelope::err(req.id, kinds::NOT_IMPLEMENTED, req.method.clone()),
            };
            let out = serde_json::to_vec(&resp).unwrap();
            if writer.write_frame(&out).await.is_err() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn calls_round_trip() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        tokio::spawn(echo_server(server_side));
        let transport = RawTransport::from_stream(client_side, Duration::from_secs(1));

        let out = transport
            .call("echo", json!({"track": 7}))
            .await
            .unwrap();
        assert_eq!(out["track"], 7);
    }

    #[tokio::test]
    async fn remote_errors_carry_kind_and_message() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        tokio::spawn(echo_server(server_side));
        let transport = RawTransport::from_stream(client_side, Duration::from_secs(1));

        match transport.call("fail", Value::Null).await {
            Err(TransportError::Remote { kind, message }) => {
                assert_eq!(kind, kinds::INTERNAL);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_calls_time_out_and_release_their_slot() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        tokio::spawn(echo_server(server_side));
        let transport = RawTransport::from_stream(client_side, Duration::from_millis(50));

        let err = transport.call("sleep", Value::Null).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
        assert!(transport.pending.is_empty());

        // The connection is still usable afterwards.
        let out = transport.call("echo", json!("still here")).await.unwrap();
        assert_eq!(out, json!("still here"));
    }

    #[tokio::test]
    async fn peer_hangup_fails_outstanding_calls() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let transport = RawTransport::from_stream(client_side, Duration::from_secs(5));
        // Server never answers, then hangs up.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(server_side);
        });

        let err = transport.call("echo", Value::Null).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed));
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn concurrent_calls_multiplex_on_one_stream() {
        let (client_side, server_side) = tokio::io::duplex(16 * 1024);
        tokio::spawn(echo_server(server_side));
        let transport = Arc::new(RawTransport::from_stream(client_side, Duration::from_secs(1)));

        let mut handles = Vec::new();
        for i in 0..16u32 {
            let t = transport.clone();
            handles.push(tokio::spawn(async move {
                t.call("echo", json!({"i": i})).await.unwrap()
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            let out = handle.await.unwrap();
            assert_eq!(out["i"], i as u32);
        }
    }
}
