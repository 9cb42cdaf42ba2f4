/**
 * HUB DE DIFFUSION - Fan-out des échantillons vers les clients SSE
 *
 * RÔLE :
 * Maintient le registre des abonnés SSE et pousse chaque échantillon ingéré
 * vers tous les clients connectés.
 *
 * FONCTIONNEMENT :
 * - Une tâche tokio unique possède le registre (aucun verrou)
 * - Toutes les mutations arrivent via un canal mpsc (HubCommand)
 * - Le HubHandle est Send + Sync : appelable depuis le thread MQTT
 * - Chaque abonné a un canal borné ; plein ou fermé = abonné retiré
 * - Keep-alive : frame de commentaire après une fenêtre d'inactivité
 */

use futures::Stream;
use kelo_core::{LatestCache, TelemetrySample};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

pub type SubscriberId = u64;

/// Upper bound for the per-client buffer, in frames.
pub const MAX_CLIENT_BUFFER: usize = 65_536;

/// What a streaming client receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Sample(TelemetrySample),
    KeepAlive,
}

/// Subscriber registry. Owned by a single task; see [`spawn_hub`].
pub struct Hub {
    cache: Arc<LatestCache>,
    subscribers: BTreeMap<SubscriberId, mpsc::Sender<TelemetrySample>>,
    next_id: SubscriberId,
    buffer: usize,
}

impl Hub {
    pub fn new(cache: Arc<LatestCache>, buffer: usize) -> Self {
        Self {
            cache,
            subscribers: BTreeMap::new(),
            next_id: 1,
            buffer: buffer.clamp(1, MAX_CLIENT_BUFFER),
        }
    }

    /// Registers a client, primed with the cached samples before any live update.
    pub fn subscribe(&mut self) -> (SubscriberId, mpsc::Receiver<TelemetrySample>) {
        let primed = self.cache.snapshot();
        let (tx, rx) = mpsc::channel(self.buffer.saturating_add(primed.len()));
        for sample in primed {
            // capacity covers the primed samples
            let _ = tx.try_send(sample);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.insert(id, tx);
        tracing::debug!(subscriber = id, total = self.subscribers.len(), "SSE client subscribed");
        (id, rx)
    }

    /// Delivers to every subscriber; returns how many accepted the sample.
    pub fn publish(&mut self, sample: &TelemetrySample) -> usize {
        let ids: Vec<SubscriberId> = self.subscribers.keys().copied().collect();
        let mut delivered = 0;

        for id in ids {
            let Some(tx) = self.subscribers.get(&id) else {
                continue;
            };
            match tx.try_send(sample.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = id, "SSE client too slow, dropping it");
                    self.subscribers.remove(&id);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(subscriber = id, "SSE client gone");
                    self.subscribers.remove(&id);
                }
            }
        }
        delivered
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        if removed {
            tracing::debug!(subscriber = id, total = self.subscribers.len(), "SSE client unsubscribed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

enum HubCommand {
    Subscribe(oneshot::Sender<(SubscriberId, mpsc::Receiver<TelemetrySample>)>),
    Publish(TelemetrySample),
    Unsubscribe(SubscriberId),
    Count(oneshot::Sender<usize>),
}

/// Thread-safe entry point to the hub task.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
    keep_alive: Duration,
}

/// Starts the hub task on the current tokio runtime. The task stops once
/// every handle and subscription is dropped.
pub fn spawn_hub(cache: Arc<LatestCache>, keep_alive: Duration, buffer: usize) -> HubHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut hub = Hub::new(cache, buffer);

    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                HubCommand::Subscribe(reply) => {
                    let (id, stream) = hub.subscribe();
                    if reply.send((id, stream)).is_err() {
                        hub.unsubscribe(id);
                    }
                }
                HubCommand::Publish(sample) => {
                    let delivered = hub.publish(&sample);
                    tracing::trace!(nid = %sample.node_id, delivered, "sample broadcast");
                }
                HubCommand::Unsubscribe(id) => {
                    hub.unsubscribe(id);
                }
                HubCommand::Count(reply) => {
                    let _ = reply.send(hub.len());
                }
            }
        }
        tracing::debug!("broadcast hub stopped");
    });

    HubHandle { tx, keep_alive }
}

impl HubHandle {
    /// Queues a sample for fan-out. Safe to call from any thread.
    pub fn publish(&self, sample: TelemetrySample) -> bool {
        self.tx.send(HubCommand::Publish(sample)).is_ok()
    }

    pub async fn subscribe(&self) -> Option<Subscription> {
        let (reply, response) = oneshot::channel();
        self.tx.send(HubCommand::Subscribe(reply)).ok()?;
        let (id, rx) = response.await.ok()?;
        Some(Subscription {
            id,
            rx,
            keep_alive: self.keep_alive,
            hub: self.tx.clone(),
        })
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        let _ = self.tx.send(HubCommand::Unsubscribe(id));
    }

    pub async fn subscriber_count(&self) -> usize {
        let (reply, response) = oneshot::channel();
        if self.tx.send(HubCommand::Count(reply)).is_err() {
            return 0;
        }
        response.await.unwrap_or(0)
    }
}

/// One streaming client. Dropping it unsubscribes from the hub.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<TelemetrySample>,
    keep_alive: Duration,
    hub: mpsc::UnboundedSender<HubCommand>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next sample, or a keep-alive after `keep_alive` without one.
    /// `None` once the hub dropped this subscriber.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        match tokio::time::timeout(self.keep_alive, self.rx.recv()).await {
            Ok(Some(sample)) => Some(Frame::Sample(sample)),
            Ok(None) => None,
            Err(_) => Some(Frame::KeepAlive),
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Frame> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let frame = sub.next_frame().await?;
            Some((frame, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.hub.send(HubCommand::Unsubscribe(self.id));
    }
}
