//! WebSocket link using `tokio-tungstenite`.
//!
//! Every binary frame is `[channel id][payload]`. Reliability classes are
//! all carried over the one TCP stream, so the unreliable channels are
//! simply delivered reliably; their size limits still apply.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};
use tokio::task::AbortHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use crate::{
    Channel, Endpoint, Link, LinkEvent, LinkId, SendError, TransportError,
};

enum Outbound {
    Frame(Channel, Vec<u8>),
    Flush,
    Close,
}

/// State shared with the background socket tasks.
struct Inner {
    events: Mutex<VecDeque<LinkEvent>>,
    notify: Arc<Notify>,
    writers: Mutex<HashMap<LinkId, mpsc::UnboundedSender<Outbound>>>,
    addresses: Mutex<HashMap<LinkId, SocketAddr>>,
    next_link: AtomicU64,
}

impl Inner {
    fn push(&self, event: LinkEvent) {
        lock(&self.events).push_back(event);
        self.notify.notify_one();
    }

    fn allocate(&self) -> LinkId {
        LinkId::new(self.next_link.fetch_add(1, Ordering::Relaxed))
    }

    fn register(
        &self,
        link: LinkId,
        addr: SocketAddr,
    ) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.writers).insert(link, tx);
        lock(&self.addresses).insert(link, addr);
        rx
    }

    fn forget(&self, link: LinkId) {
        lock(&self.writers).remove(&link);
        lock(&self.addresses).remove(&link);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A direct-mode [`Link`] over WebSockets.
///
/// Must be used from inside a Tokio runtime: socket I/O runs on spawned
/// tasks that queue [`LinkEvent`]s for the next [`poll`](Link::poll).
pub struct WebSocketLink {
    inner: Arc<Inner>,
    listener: Option<(SocketAddr, AbortHandle)>,
}

impl Default for WebSocketLink {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketLink {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                events: Mutex::new(VecDeque::new()),
                notify: Arc::new(Notify::new()),
                writers: Mutex::new(HashMap::new()),
                addresses: Mutex::new(HashMap::new()),
                next_link: AtomicU64::new(1),
            }),
            listener: None,
        }
    }

    /// The bound address while listening. Useful after binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|(addr, _)| *addr)
    }

    fn direct(endpoint: &Endpoint) -> Result<SocketAddr, TransportError> {
        match endpoint {
            Endpoint::Direct(addr) => Ok(*addr),
            Endpoint::Relay(_) => Err(TransportError::RelayUnsupported),
        }
    }

    fn runtime() -> Result<tokio::runtime::Handle, TransportError> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::NoRuntime(e.to_string()))
    }
}

impl Link for WebSocketLink {
    fn listen(&mut self, endpoint: &Endpoint) -> Result<(), TransportError> {
        if self.listener.is_some() {
            return Err(TransportError::AlreadyListening);
        }
        let addr = Self::direct(endpoint)?;
        let runtime = Self::runtime()?;

        // Bind synchronously so the caller sees bind errors right away.
        let std_listener = std::net::TcpListener::bind(addr)
            .map_err(TransportError::BindFailed)?;
        std_listener
            .set_nonblocking(true)
            .map_err(TransportError::BindFailed)?;
        let local = std_listener
            .local_addr()
            .map_err(TransportError::BindFailed)?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(std_listener)
                .map_err(TransportError::BindFailed)?
        };

        let inner = Arc::clone(&self.inner);
        let task = runtime.spawn(accept_loop(listener, inner));
        tracing::info!(%local, "WebSocket link listening");
        self.listener = Some((local, task.abort_handle()));
        Ok(())
    }

    fn stop_listening(&mut self) {
        if let Some((addr, task)) = self.listener.take() {
            task.abort();
            tracing::info!(%addr, "WebSocket link stopped listening");
        }
    }

    fn connect(
        &mut self,
        endpoint: &Endpoint,
    ) -> Result<LinkId, TransportError> {
        let addr = Self::direct(endpoint)?;
        let runtime = Self::runtime()?;

        let link = self.inner.allocate();
        let rx = self.inner.register(link, addr);
        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            let url = format!("ws://{addr}");
            match tokio_tungstenite::connect_async(&url).await {
                Ok((ws, _)) => {
                    tracing::debug!(%link, %addr, "WebSocket connected");
                    inner.push(LinkEvent::Connected(link));
                    drive(inner, link, ws, rx).await;
                }
                Err(e) => {
                    inner.forget(link);
                    inner.push(LinkEvent::Error {
                        link,
                        cause: e.to_string(),
                    });
                    inner.push(LinkEvent::Disconnected(link));
                }
            }
        });
        Ok(link)
    }

    fn send(
        &mut self,
        link: LinkId,
        channel: Channel,
        data: &[u8],
    ) -> Result<(), SendError> {
        let writers = lock(&self.inner.writers);
        let tx = writers.get(&link).ok_or(SendError::NotConnected)?;
        tx.send(Outbound::Frame(channel, data.to_vec()))
            .map_err(|_| SendError::NotConnected)
    }

    fn flush(&mut self, link: LinkId) {
        if let Some(tx) = lock(&self.inner.writers).get(&link) {
            let _ = tx.send(Outbound::Flush);
        }
    }

    fn close(&mut self, link: LinkId) {
        lock(&self.inner.addresses).remove(&link);
        if let Some(tx) = lock(&self.inner.writers).remove(&link) {
            let _ = tx.send(Outbound::Close);
        }
    }

    fn poll(&mut self, out: &mut Vec<LinkEvent>) {
        out.extend(lock(&self.inner.events).drain(..));
    }

    fn activity(&self) -> Arc<Notify> {
        Arc::clone(&self.inner.notify)
    }

    fn peer_address(&self, link: LinkId) -> Option<String> {
        lock(&self.inner.addresses)
            .get(&link)
            .map(ToString::to_string)
    }
}

impl Drop for WebSocketLink {
    fn drop(&mut self) {
        self.stop_listening();
        for (_, tx) in lock(&self.inner.writers).drain() {
            let _ = tx.send(Outbound::Close);
        }
    }
}

async fn accept_loop(listener: TcpListener, inner: Arc<Inner>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let ws = match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "WebSocket handshake failed");
                    return;
                }
            };
            let link = inner.allocate();
            let rx = inner.register(link, addr);
            tracing::debug!(%link, %addr, "accepted WebSocket connection");
            inner.push(LinkEvent::Connected(link));
            drive(inner, link, ws, rx).await;
        });
    }
}

/// Pumps one socket until either side closes it.
async fn drive<S>(
    inner: Arc<Inner>,
    link: LinkId,
    ws: WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();

    let closed_locally = loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outbound::Frame(channel, data)) => {
                    let frame = encode_frame(channel, &data);
                    if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                        inner.push(LinkEvent::Error { link, cause: e.to_string() });
                        break false;
                    }
                }
                Some(Outbound::Flush) => {
                    let _ = sink.flush().await;
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.close().await;
                    break true;
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(bytes))) => match decode_frame(&bytes) {
                    Ok((channel, data)) => {
                        inner.push(LinkEvent::Message { link, channel, data });
                    }
                    Err(e) => {
                        inner.push(LinkEvent::Error { link, cause: e.to_string() });
                    }
                },
                Some(Ok(Message::Close(_))) | None => break false,
                Some(Ok(_)) => {} // ping/pong/text
                Some(Err(e)) => {
                    inner.push(LinkEvent::Error { link, cause: e.to_string() });
                    break false;
                }
            },
        }
    };

    inner.forget(link);
    if !closed_locally {
        tracing::debug!(%link, "WebSocket closed by remote");
        inner.push(LinkEvent::Disconnected(link));
    }
}

fn encode_frame(channel: Channel, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(data.len() + 1);
    frame.push(channel.id());
    frame.extend_from_slice(data);
    frame
}

fn decode_frame(frame: &[u8]) -> Result<(Channel, Vec<u8>), SendError> {
    let (&id, payload) = frame
        .split_first()
        .ok_or_else(|| SendError::Link("empty frame".to_owned()))?;
    let channel = Channel::from_id(id)?;
    if payload.len() > channel.max_message() {
        return Err(SendError::PayloadTooLarge {
            channel,
            size: payload.len(),
            max: channel.max_message(),
        });
    }
    Ok((channel, payload.to_vec()))
}
