//! Hyper transport bridge.
//!
//! Runs a synchronous handler chain behind a hyper HTTP/1.1 server. Each
//! request body is collected first, then the chain runs on the blocking pool
//! and writes through a [`ChannelWriter`]:
//!
//! ```text
//! hyper ──request──▶ HyperService ──spawn_blocking──▶ chain(ChannelWriter)
//!   ▲                                                     │
//!   └────────── head (oneshot) + ChannelBody (mpsc) ◀─────┘
//! ```
//!
//! The response head goes out on the first status, write or flush. Body
//! bytes are batched and sent as a frame when the batch fills up or the
//! handler flushes. At most [`CHANNEL_CAPACITY`] frames wait for the client;
//! past that, writes block the handler thread until hyper polls the body.
//! Hijacking is not available on this transport.
//!
//! If the chain panics before the head is sent, the service fails with
//! [`TransportError::Aborted`]; afterwards the body ends with
//! [`TransportError::StreamAborted`]. Either way hyper drops the connection.

use crate::error::{TransportError, WriterError};
use crate::handler::{BoxHandler, Handler};
use crate::logger::Logger;
use crate::stages::recovery::{panic_message, AbortHandler};
use crate::writer::ResponseWriter;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use http_body_util::BodyExt;
use hyper::body::{Body, Frame};
use hyper::server::conn::http1;
use hyper::service::Service;
use hyper_util::rt::TokioIo;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

/// Body bytes batched before a frame is sent without an explicit flush.
pub const FRAME_SIZE: usize = 8 * 1024;

/// Frames queued between the handler and hyper before writes block.
pub const CHANNEL_CAPACITY: usize = 8;

type Chunk = Result<Bytes, TransportError>;

/// Response body fed by a [`ChannelWriter`].
pub struct ChannelBody {
    rx: mpsc::Receiver<Chunk>,
}

impl fmt::Debug for ChannelBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelBody").finish_non_exhaustive()
    }
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = TransportError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|result| result.map(Frame::data)))
    }
}

/// The bottom of the writer chain on the hyper transport.
pub struct ChannelWriter {
    headers: HeaderMap,
    status: Option<StatusCode>,
    head_tx: Option<oneshot::Sender<http::response::Parts>>,
    body_tx: mpsc::Sender<Chunk>,
    pending: Vec<u8>,
    finished: bool,
}

impl fmt::Debug for ChannelWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelWriter")
            .field("status", &self.status)
            .field("pending", &self.pending.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl ChannelWriter {
    /// Creates a writer and the receiving ends of its head and body.
    ///
    /// The writer blocks on a full body channel, so it must be driven from a
    /// blocking thread, never from inside an async task.
    pub fn channel() -> (Self, oneshot::Receiver<http::response::Parts>, ChannelBody) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let writer = Self {
            headers: HeaderMap::new(),
            status: None,
            head_tx: Some(head_tx),
            body_tx,
            pending: Vec::with_capacity(FRAME_SIZE),
            finished: false,
        };
        (writer, head_rx, ChannelBody { rx })
    }

    /// Sends the head if needed and any batched bytes, then ends the body.
    pub fn finish(mut self) {
        self.send_head(StatusCode::OK);
        let _ = self.push_pending();
        self.finished = true;
    }

    fn send_head(&mut self, status: StatusCode) {
        let Some(head_tx) = self.head_tx.take() else {
            return;
        };
        self.status = Some(status);

        let mut response = http::Response::new(());
        *response.status_mut() = status;
        *response.headers_mut() = self.headers.clone();
        let (parts, ()) = response.into_parts();
        // A dropped receiver means the client is gone; body sends will fail too.
        let _ = head_tx.send(parts);
    }

    fn push_pending(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(std::mem::replace(
            &mut self.pending,
            Vec::with_capacity(FRAME_SIZE),
        ));
        self.body_tx
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"))
    }
}

impl ResponseWriter for ChannelWriter {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Interim statuses other than `101` cannot be relayed and are dropped.
    fn write_header(&mut self, status: StatusCode) {
        if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
            return;
        }
        self.send_head(status);
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send_head(StatusCode::OK);
        self.pending.extend_from_slice(buf);
        if self.pending.len() >= FRAME_SIZE {
            self.push_pending()?;
        }
        Ok(buf.len())
    }

    fn try_flush(&mut self) -> Option<Result<(), WriterError>> {
        self.send_head(StatusCode::OK);
        Some(self.push_pending().map_err(WriterError::from))
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Dropping an unsent head fails the service call instead.
        if self.head_tx.is_none() {
            let _ = self.body_tx.blocking_send(Err(TransportError::StreamAborted));
        }
    }
}

/// A hyper service running a handler chain.
#[derive(Clone)]
pub struct HyperService {
    handler: BoxHandler,
    logger: Logger,
}

impl fmt::Debug for HyperService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HyperService").finish_non_exhaustive()
    }
}

impl HyperService {
    /// Serves requests with `handler`.
    pub fn new(handler: BoxHandler, logger: Logger) -> Self {
        Self { handler, logger }
    }
}

impl<B> Service<http::Request<B>> for HyperService
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: fmt::Display,
{
    type Response = http::Response<ChannelBody>;
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: http::Request<B>) -> Self::Future {
        let handler = Arc::clone(&self.handler);
        let logger = self.logger.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| TransportError::Body(e.to_string()))?
                .to_bytes();
            let request = http::Request::from_parts(parts, body);

            let (writer, head_rx, body) = ChannelWriter::channel();
            let task = tokio::task::spawn_blocking(move || {
                let mut writer = writer;
                handler.serve(&mut writer, request);
                writer.finish();
            });
            tokio::spawn(async move {
                let Err(err) = task.await else {
                    return;
                };
                if !err.is_panic() {
                    return;
                }
                let payload = err.into_panic();
                logger.scope(|| {
                    if payload.is::<AbortHandler>() {
                        tracing::debug!("handler aborted the connection");
                    } else {
                        tracing::error!(
                            panic = %panic_message(&*payload),
                            "panic escaped the handler chain"
                        );
                    }
                });
            });

            let head = head_rx.await.map_err(|_| TransportError::Aborted)?;
            Ok(http::Response::from_parts(head, body))
        })
    }
}

/// Serves one HTTP/1.1 connection.
pub async fn serve_connection(stream: TcpStream, service: HyperService) -> Result<(), hyper::Error> {
    http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
}

/// Accepts connections until `shutdown` completes.
///
/// Connections already accepted keep running on their own tasks.
pub async fn serve(
    listener: TcpListener,
    service: HyperService,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, remote_addr)) => {
                        let service = service.clone();
                        let logger = service.logger.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, service).await {
                                logger.scope(|| {
                                    tracing::debug!(%remote_addr, error = %e, "connection error");
                                });
                            }
                        });
                    }
                    Err(e) => {
                        service.logger.scope(|| {
                            tracing::error!(error = %e, "failed to accept connection");
                        });
                    }
                }
            }
            () = &mut shutdown => {
                service.logger.scope(|| tracing::info!("shutdown signal received, stopping accept loop"));
                break;
            }
        }
    }
}
