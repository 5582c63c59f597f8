//! Long-lived subscriber connections.
//!
//! Each websocket session owns a reader that routes heartbeats and a writer
//! that drains the outbound queue and sends keep-alive pings. The
//! [`ConnectionRegistry`] maps a connection key to the live session's
//! [`ClientHandle`].

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, close_code};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, interval_at, timeout};
use tracing::{debug, info, warn};

use crate::instance::InstanceService;
use crate::message::Heartbeat;

/// `<app>:<ip>:<port>`, the key a subscriber connects with.
pub fn connection_key(app_id: &str, ip: &str, port: u16) -> String {
    format!("{app_id}:{ip}:{port}")
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub write_wait: Duration,
    /// A session with no inbound traffic for this long is dropped.
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub queue: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_secs(60),
            ping_period: Duration::from_secs(20),
            queue: 256,
        }
    }
}

/// Sending side of one session.
#[derive(Clone)]
pub struct ClientHandle {
    id: u64,
    key: String,
    outbound: mpsc::Sender<String>,
    close: Arc<watch::Sender<bool>>,
}

impl ClientHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Queues a text frame. Returns false when the session is gone or its
    /// queue is full.
    pub fn send(&self, frame: String) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(key = %self.key, "subscriber queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn close(&self) {
        self.close.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.close.borrow() || self.outbound.is_closed()
    }
}

/// Receiving side of one session, consumed by its writer.
pub struct ClientChannels {
    pub outbound: mpsc::Receiver<String>,
    pub closed: watch::Receiver<bool>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    clients: Mutex<HashMap<String, ClientHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an unregistered handle and the channels its session drains.
    pub fn open(&self, key: &str, queue: usize) -> (ClientHandle, ClientChannels) {
        let (outbound_tx, outbound) = mpsc::channel(queue.max(1));
        let (close_tx, closed) = watch::channel(false);
        let handle = ClientHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            key: key.to_string(),
            outbound: outbound_tx,
            close: Arc::new(close_tx),
        };
        (handle, ClientChannels { outbound, closed })
    }

    /// Makes `handle` the live session for its key, closing any previous one.
    pub fn register(&self, handle: ClientHandle) {
        let mut clients = self.clients.lock();
        if let Some(previous) = clients.get(&handle.key) {
            info!(key = %handle.key, "closing superseded connection");
            previous.close();
        }
        clients.insert(handle.key.clone(), handle);
    }

    /// Removes the entry for `key` only if it still belongs to session `id`.
    pub fn unregister(&self, key: &str, id: u64) -> bool {
        let mut clients = self.clients.lock();
        match clients.get(key) {
            Some(live) if live.id == id => {
                clients.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, key: &str) -> Option<ClientHandle> {
        self.clients.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs one subscriber session until either direction ends, then removes it
/// from the registry.
pub async fn run_session<W, R, E>(
    writer: W,
    reader: R,
    key: String,
    registry: Arc<ConnectionRegistry>,
    instances: Arc<InstanceService>,
    settings: SessionSettings,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let (handle, channels) = registry.open(&key, settings.queue);
    let id = handle.id();
    registry.register(handle);
    info!(%key, id, "subscriber connected");

    tokio::select! {
        _ = read_loop(reader, &key, &instances, settings.pong_wait) => {}
        _ = write_loop(writer, channels, &key, settings) => {}
    }

    registry.unregister(&key, id);
    info!(%key, id, "subscriber disconnected");
}

async fn read_loop<R, E>(mut reader: R, key: &str, instances: &InstanceService, pong_wait: Duration)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let message = match timeout(pong_wait, reader.next()).await {
            Err(_) => {
                warn!(%key, "no traffic from subscriber, dropping connection");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(err))) => {
                debug!(%key, error = %err, "subscriber read failed");
                return;
            }
            Ok(Some(Ok(message))) => message,
        };
        let beat = match message {
            Message::Text(text) => serde_json::from_str::<Heartbeat>(&text),
            Message::Binary(bytes) => serde_json::from_slice::<Heartbeat>(&bytes),
            Message::Close(_) => return,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        match beat {
            Ok(beat) => {
                if let Err(err) = instances.heartbeat(&beat).await {
                    warn!(%key, error = %err, "heartbeat rejected");
                }
            }
            Err(err) => warn!(%key, error = %err, "unreadable heartbeat"),
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    channels: ClientChannels,
    key: &str,
    settings: SessionSettings,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let ClientChannels {
        mut outbound,
        mut closed,
    } = channels;
    let mut keep_alive = interval_at(Instant::now() + settings.ping_period, settings.ping_period);

    loop {
        let message = tokio::select! {
            frame = outbound.recv() => match frame {
                Some(text) => Message::Text(text),
                None => break,
            },
            _ = keep_alive.tick() => Message::Ping(b"ping".to_vec()),
            Ok(()) = closed.changed() => {
                let frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: "replaced by a newer connection".into(),
                };
                let _ = send(&mut writer, Message::Close(Some(frame)), settings.write_wait).await;
                return;
            }
        };
        if let Err(err) = send(&mut writer, message, settings.write_wait).await {
            debug!(%key, error = %err, "subscriber write failed");
            return;
        }
    }
    let _ = send(&mut writer, Message::Close(None), settings.write_wait).await;
}

async fn send<W>(writer: &mut W, message: Message, write_wait: Duration) -> Result<(), String>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    match timeout(write_wait, writer.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err("write timed out".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use futures::channel::mpsc as fmpsc;
    use raft_store::{KvStore, MemoryStore};

    use super::*;

    type Inbound = fmpsc::UnboundedSender<Result<Message, Infallible>>;
    type Outbound = fmpsc::UnboundedReceiver<Message>;

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        instances: Arc<InstanceService>,
        store: Arc<MemoryStore>,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new(1, "127.0.0.1:9000"));
            Self {
                registry: Arc::new(ConnectionRegistry::new()),
                instances: Arc::new(InstanceService::new(store.clone())),
                store,
            }
        }

        fn connect(&self, key: &str) -> (Inbound, Outbound, tokio::task::JoinHandle<()>) {
            let (in_tx, in_rx) = fmpsc::unbounded();
            let (out_tx, out_rx) = fmpsc::unbounded();
            let task = tokio::spawn(run_session(
                out_tx,
                in_rx,
                key.to_string(),
                self.registry.clone(),
                self.instances.clone(),
                SessionSettings::default(),
            ));
            (in_tx, out_rx, task)
        }

        async fn wait_registered(
            &self,
            key: &str,
            not_id: Option<u64>,
        ) -> anyhow::Result<ClientHandle> {
            for _ in 0..100 {
                if let Some(handle) = self.registry.lookup(key) {
                    if Some(handle.id()) != not_id {
                        return Ok(handle);
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            anyhow::bail!("{key} never registered")
        }
    }

    #[test]
    fn unregister_ignores_superseded_sessions() {
        let registry = ConnectionRegistry::new();
        let (old, mut old_channels) = registry.open("demo:10.0.0.5:8080", 4);
        let (new, _new_channels) = registry.open("demo:10.0.0.5:8080", 4);
        registry.register(old.clone());
        registry.register(new.clone());

        assert!(*old_channels.closed.borrow_and_update());
        assert!(old.is_closed());
        assert!(!registry.unregister("demo:10.0.0.5:8080", old.id()));
        assert_eq!(registry.lookup("demo:10.0.0.5:8080").map(|h| h.id()), Some(new.id()));
        assert!(registry.unregister("demo:10.0.0.5:8080", new.id()));
        assert!(registry.is_empty());
    }

    #[test]
    fn full_queue_drops_frames() {
        let registry = ConnectionRegistry::new();
        let (handle, _channels) = registry.open("k", 1);
        assert!(handle.send("a".into()));
        assert!(!handle.send("b".into()));
    }

    #[tokio::test]
    async fn session_delivers_frames_and_routes_heartbeats() -> anyhow::Result<()> {
        let harness = Harness::new();
        let (inbound, mut outbound, task) = harness.connect("demo:10.0.0.5:8080");
        let handle = harness.wait_registered("demo:10.0.0.5:8080", None).await?;

        assert!(handle.send("{\"key\":\"a\"}\u{1}".into()));
        let frame = timeout(Duration::from_secs(2), outbound.next()).await?;
        assert_eq!(frame, Some(Message::Text("{\"key\":\"a\"}\u{1}".into())));

        let beat = r#"{"appId":"demo","group":"group","ip":"10.0.0.5","port":8080,"enableSvc":true}"#;
        inbound.unbounded_send(Ok(Message::Text(beat.into())))?;
        for _ in 0..100 {
            if harness.store.get("instance.info.demo.group.10.0.0.5:8080").is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(harness.store.get("instance.info.demo.group.10.0.0.5:8080")?, "UP");

        inbound.close_channel();
        timeout(Duration::from_secs(2), task).await??;
        assert!(harness.registry.lookup("demo:10.0.0.5:8080").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn reconnect_closes_the_previous_session() -> anyhow::Result<()> {
        let harness = Harness::new();
        let key = "demo:10.0.0.5:8080";
        let (_first_in, mut first_out, first_task) = harness.connect(key);
        let first = harness.wait_registered(key, None).await?;

        let (_second_in, _second_out, _second_task) = harness.connect(key);
        let second = harness.wait_registered(key, Some(first.id())).await?;
        assert_ne!(first.id(), second.id());

        let close = timeout(Duration::from_secs(2), first_out.next()).await?;
        assert!(matches!(close, Some(Message::Close(Some(_)))));
        timeout(Duration::from_secs(2), first_task).await??;

        // The old session ending must not evict the new one.
        assert_eq!(harness.registry.lookup(key).map(|h| h.id()), Some(second.id()));
        Ok(())
    }
}
