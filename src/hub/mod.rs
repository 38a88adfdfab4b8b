//! The hub: one explicitly constructed service object per server.
//!
//! It owns the store, the broker, the dispatcher and the gossip engines, runs
//! every inbound frame on a bounded worker pool and drives the background
//! loops:
//! - accepted-message handoff into the rumor engine
//! - rumor tick (cuts partial rumors, retries stalled ones)
//! - rumor state tick
//! - heartbeat tick
//! - closed-socket reaper
//!
//! Frames from one peer server run one after the other, in arrival order;
//! client frames run concurrently. Everything stops on `shutdown`, which waits
//! for in-flight workers up to the configured grace period.

pub mod router;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::broker::Broker;
use crate::channel::{Accepted, Dispatcher};
use crate::client::Client;
use crate::config::Settings;
use crate::gossip::{GossipPolicy, HeartbeatExchange, PendingQueries, Replayer, RumorEngine};
use crate::persistence::Store;
use crate::transport::message::{Method, ServerGreeting};
use crate::utils::Result;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Held by the worker running a peer's frame until it is done.
type SocketOrder = Arc<tokio::sync::Mutex<()>>;

pub struct Hub {
    settings: Settings,
    store: Store,
    broker: Arc<Broker>,
    dispatcher: Arc<Dispatcher>,
    queries: Arc<PendingQueries>,
    rumors: Arc<RumorEngine>,
    heartbeats: Arc<HeartbeatExchange>,
    replayer: Arc<Replayer>,
    workers: Arc<Semaphore>,
    ordering: Mutex<HashMap<String, SocketOrder>>,
    /// Server sockets we already sent our greeting to.
    greeted: Mutex<HashSet<String>>,
    shutdown: watch::Sender<bool>,
    accepted: Mutex<Option<UnboundedReceiver<Accepted>>>,
    closed_tx: UnboundedSender<String>,
    closed_rx: Mutex<Option<UnboundedReceiver<String>>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    pub fn new(settings: Settings, store: Store) -> Result<Arc<Self>> {
        let keys = store.server_keypair()?;

        let broker = Arc::new(Broker::new());
        let channels = store.all_channels()?;
        for (path, record) in &channels {
            broker.add_channel(path, record.kind);
        }

        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            broker.clone(),
            keys,
            settings.server.clone(),
            accepted_tx,
        ));
        let replayer = Arc::new(Replayer::new(
            dispatcher.clone(),
            settings.gossip.max_dispatch_passes,
            settings.gossip.max_unprocessed_attempts,
        ));
        let queries = Arc::new(PendingQueries::new());
        let rumors = Arc::new(RumorEngine::new(
            store.clone(),
            broker.clone(),
            queries.clone(),
            replayer.clone(),
            GossipPolicy::from_settings(&settings.gossip),
            dispatcher.server_key(),
        ));
        let heartbeats = Arc::new(HeartbeatExchange::new(
            store.clone(),
            broker.clone(),
            queries.clone(),
            replayer.clone(),
        ));

        let (shutdown, _) = watch::channel(false);
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        tracing::info!(
            server_id = %dispatcher.server_key(),
            channels = channels.len(),
            "hub ready"
        );

        Ok(Arc::new(Self {
            workers: Arc::new(Semaphore::new(settings.workers.pool_size.max(1))),
            settings,
            store,
            broker,
            dispatcher,
            queries,
            rumors,
            heartbeats,
            replayer,
            ordering: Mutex::new(HashMap::new()),
            greeted: Mutex::new(HashSet::new()),
            shutdown,
            accepted: Mutex::new(Some(accepted_rx)),
            closed_tx,
            closed_rx: Mutex::new(Some(closed_rx)),
            loops: Mutex::new(Vec::new()),
        }))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn rumors(&self) -> &Arc<RumorEngine> {
        &self.rumors
    }

    pub fn heartbeats(&self) -> &Arc<HeartbeatExchange> {
        &self.heartbeats
    }

    pub fn server_id(&self) -> String {
        self.dispatcher.server_key()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Flips to `true` once `shutdown` starts; listeners stop accepting then.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Finish messages parked by a previous run, then spawn the background
    /// loops. Calling it twice has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut loops = lock(&self.loops);
        let (Some(accepted), Some(closed)) =
            (lock(&self.accepted).take(), lock(&self.closed_rx).take())
        else {
            return;
        };

        let resumed = self.replayer.retry_parked();
        if resumed.applied > 0 || resumed.abandoned > 0 {
            tracing::info!(
                applied = resumed.applied,
                abandoned = resumed.abandoned,
                "resumed parked messages"
            );
        }

        loops.push(tokio::spawn(self.clone().rumor_queue(accepted)));
        loops.push(tokio::spawn(self.clone().reap_closed(closed)));

        let gossip = &self.settings.gossip;
        loops.push(self.every(Duration::from_millis(gossip.rumor_interval_ms), |hub| {
            if let Err(e) = hub.rumors.flush() {
                tracing::error!(error = %e, "rumor tick failed");
            }
        }));
        loops.push(self.every(Duration::from_millis(gossip.heartbeat_interval_ms), |hub| {
            match hub.heartbeats.send_heartbeats() {
                Ok(0) => {}
                Ok(sent) => tracing::debug!(peers = sent, "heartbeats sent"),
                Err(e) => tracing::error!(error = %e, "heartbeat tick failed"),
            }
        }));
        loops.push(self.every(Duration::from_millis(gossip.rumor_state_interval_ms), |hub| {
            if let Err(e) = hub.rumors.send_rumor_state() {
                tracing::error!(error = %e, "rumor state tick failed");
            }
        }));
        tracing::info!(loops = loops.len(), "hub started");
    }

    fn every<F>(self: &Arc<Self>, period: Duration, task: F) -> JoinHandle<()>
    where
        F: Fn(&Hub) + Send + 'static,
    {
        let hub = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = time::interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => task(&*hub),
                }
            }
        })
    }

    async fn rumor_queue(self: Arc<Self>, mut accepted: UnboundedReceiver<Accepted>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                next = accepted.recv() => match next {
                    Some(next) => self.enqueue(next),
                    None => break,
                },
            }
        }
        // whatever was accepted before shutdown still joins my rumor
        while let Ok(next) = accepted.try_recv() {
            self.enqueue(next);
        }
    }

    fn enqueue(&self, accepted: Accepted) {
        let message_id = accepted.message.message_id.clone();
        if let Err(e) = self.rumors.enqueue(accepted) {
            tracing::error!(message_id = %message_id, error = %e, "failed to queue message for gossip");
        }
    }

    async fn reap_closed(self: Arc<Self>, mut closed: UnboundedReceiver<String>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let socket_id = tokio::select! {
                _ = shutdown.changed() => break,
                next = closed.recv() => match next {
                    Some(socket_id) => socket_id,
                    None => break,
                },
            };
            self.broker.cleanup_client(&socket_id);
            lock(&self.greeted).remove(&socket_id);
            lock(&self.ordering).remove(&socket_id);
            let dropped = self.queries.drop_peer(&socket_id);
            if dropped > 0 {
                tracing::debug!(socket = %socket_id, dropped, "dropped pending queries");
            }
        }
    }

    /// Make a freshly opened socket known to the broker.
    pub fn on_socket_open(&self, socket: Client) {
        tracing::info!(socket = %socket.id, server = socket.is_server(), "socket opened");
        self.broker.register_client(socket);
    }

    /// Queue the teardown of a socket; the reaper unsubscribes it everywhere.
    pub fn on_socket_closed(&self, socket_id: &str) {
        tracing::info!(socket = %socket_id, "socket closed");
        if self.closed_tx.send(socket_id.to_string()).is_err() {
            self.broker.cleanup_client(&socket_id.to_string());
        }
    }

    fn socket_order(&self, socket_id: &str) -> SocketOrder {
        lock(&self.ordering)
            .entry(socket_id.to_string())
            .or_default()
            .clone()
    }

    /// Run one inbound frame on the worker pool. Waits for a free worker, so
    /// a saturated pool slows the socket's read loop down instead of piling
    /// up tasks. A peer's next frame also waits until its previous one is
    /// done, so its rumors are applied in the order it sent them.
    pub async fn submit(self: &Arc<Self>, socket: Client, text: String) {
        if self.is_shutting_down() {
            tracing::debug!(socket = %socket.id, "shutting down, frame dropped");
            return;
        }
        let in_order = if socket.is_server() {
            Some(self.socket_order(&socket.id).lock_owned().await)
        } else {
            None
        };
        let Ok(permit) = self.workers.clone().acquire_owned().await else {
            return;
        };
        let hub = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let _in_order = in_order;
            router::handle_frame(&hub, &socket, &text);
        });
    }

    /// Send our greeting to a peer server, once per socket.
    pub fn greet(&self, peer: &Client) -> Result<()> {
        if !lock(&self.greeted).insert(peer.id.clone()) {
            return Ok(());
        }
        let greeting = ServerGreeting {
            public_key: self.server_id(),
            client_address: self.settings.server.public_client_address.clone(),
            server_address: self.settings.server.public_server_address.clone(),
        };
        peer.send_query(None, &Method::GreetServer(greeting))
    }

    /// A peer introduced itself: greet back, then start syncing with it.
    pub fn on_greeting(&self, socket: &Client, greeting: ServerGreeting) -> Result<()> {
        if !self.broker.record_peer(&socket.id, greeting.clone()) {
            tracing::debug!(peer = %socket.id, "repeated greeting ignored");
            return Ok(());
        }
        tracing::info!(
            peer = %socket.id,
            public_key = %greeting.public_key,
            server_address = %greeting.server_address,
            "peer greeted"
        );
        self.greet(socket)?;
        self.heartbeats.send_heartbeat_to(socket)?;
        self.rumors.send_rumor_state_to(socket)?;
        self.rumors.retry_stalled();
        Ok(())
    }

    /// Stop the loops, let in-flight workers finish within the grace period,
    /// then flush the store.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        tracing::info!("hub shutting down");

        let grace = Duration::from_secs(self.settings.workers.shutdown_grace_secs);
        let permits = u32::try_from(self.settings.workers.pool_size.max(1)).unwrap_or(u32::MAX);
        match time::timeout(grace, self.workers.acquire_many(permits)).await {
            Ok(Ok(_all)) => tracing::debug!("workers drained"),
            Ok(Err(_)) => {}
            Err(_) => tracing::warn!(
                grace_secs = grace.as_secs(),
                "grace period elapsed with workers still running"
            ),
        }
        self.workers.close();

        let loops = std::mem::take(&mut *lock(&self.loops));
        for handle in loops {
            let abort = handle.abort_handle();
            if time::timeout(grace, handle).await.is_err() {
                abort.abort();
            }
        }

        if let Err(e) = self.store.flush().await {
            tracing::error!(error = %e, "failed to flush store");
        }
        tracing::info!("hub stopped");
    }
}
