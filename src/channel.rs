//! Push channel lifecycle: one connection per identity, authenticated on open,
//! rooms declared on every connect, reconnected with bounded backoff.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::EventDispatcher;
use crate::transport::{ChannelError, Connection, Transport};
use crate::types::{ClientMsg, Identity, PushEvent, Room, ServerMsg};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = std::cmp::min(self.next * 2, self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.initial;
    }
}

#[derive(Default)]
struct Session {
    identity: Option<Identity>,
    rooms: Vec<Room>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<EventDispatcher>,
    settings: ChannelSettings,
    /// Generation of the current channel. Teardown takes the write lock, so it
    /// waits out an in-flight dispatch and every later dispatch sees the bump.
    live: RwLock<u64>,
    session: Mutex<Session>,
    state: watch::Sender<ChannelState>,
    connectivity: watch::Sender<bool>,
}

/// Owns the push channel for the current identity.
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<Inner>,
}

impl ChannelManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        dispatcher: Arc<EventDispatcher>,
        settings: ChannelSettings,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Idle);
        let (connectivity, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                transport,
                dispatcher,
                settings,
                live: RwLock::new(0),
                session: Mutex::new(Session::default()),
                state,
                connectivity,
            }),
        }
    }

    /// Tears down the current channel (if any) and, for `Some`, starts a new
    /// one. Setting the identity already in use is a no-op.
    ///
    /// Must be called from within a tokio runtime, and never from a consumer
    /// handler: log out through the session store instead.
    pub fn set_identity(&self, identity: Option<Identity>) {
        let mut live = self.inner.live.write();
        let mut session = self.inner.session.lock();
        if session.identity == identity {
            return;
        }

        *live += 1;
        let previous = session.task.take();
        if let Some(task) = &previous {
            task.abort();
        }
        session.rooms.clear();
        session.identity = identity.clone();
        self.inner.connectivity.send_replace(false);

        match identity {
            None => {
                self.inner.state.send_replace(ChannelState::Idle);
                info!("channel closed, idle");
            }
            Some(identity) => {
                self.inner.state.send_replace(ChannelState::Connecting);
                info!(subject_id = %identity.subject_id, role = ?identity.role, "channel connecting");
                let generation = *live;
                session.task = Some(tokio::spawn(run(
                    self.inner.clone(),
                    identity,
                    generation,
                    previous,
                )));
            }
        }
    }

    pub fn shutdown(&self) {
        self.set_identity(None);
    }

    /// Follows a credential source until it is dropped.
    pub fn follow(&self, mut credentials: watch::Receiver<Option<Identity>>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let current = credentials.borrow_and_update().clone();
            manager.set_identity(current);
            while credentials.changed().await.is_ok() {
                let next = credentials.borrow_and_update().clone();
                manager.set_identity(next);
            }
            debug!("credential source closed");
        })
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// `true` exactly while the channel is connected.
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.inner.connectivity.subscribe()
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.inner.session.lock().rooms.clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.session.lock().identity.clone()
    }
}

async fn run(
    inner: Arc<Inner>,
    identity: Identity,
    generation: u64,
    previous: Option<JoinHandle<()>>,
) {
    // The retired channel must be gone before this one opens.
    if let Some(previous) = previous {
        let _ = previous.await;
    }

    let mut backoff = Backoff::new(inner.settings.backoff_initial, inner.settings.backoff_max);
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        match inner.handshake(&identity).await {
            Ok(conn) => {
                backoff.reset();
                attempt = 0;
                inner.serve(generation, &identity, conn).await;
            }
            Err(e) => {
                warn!(subject_id = %identity.subject_id, attempt, error = %e, "channel handshake failed");
            }
        }

        if !inner.mark_disconnected(generation) {
            return;
        }
        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        tokio::time::sleep(delay).await;
    }
}

impl Inner {
    async fn handshake(&self, identity: &Identity) -> Result<Box<dyn Connection>, ChannelError> {
        let mut conn = self.transport.open().await?;
        conn.send(&ClientMsg::Authenticate {
            token: identity.credential.to_string(),
        })
        .await?;

        let reply = tokio::time::timeout(self.settings.handshake_timeout, conn.recv())
            .await
            .map_err(|_| ChannelError::HandshakeTimeout)?;

        let err = match reply {
            Some(Ok(ServerMsg::Ready)) => return Ok(conn),
            Some(Ok(ServerMsg::Rejected { reason })) => ChannelError::Rejected(reason),
            Some(Ok(ServerMsg::Event(event))) => {
                ChannelError::Protocol(format!("event {} before handshake", event.name))
            }
            Some(Err(e)) => e,
            None => ChannelError::Closed,
        };
        conn.close().await;
        Err(err)
    }

    /// Declares rooms, then dispatches events until the connection drops.
    async fn serve(&self, generation: u64, identity: &Identity, mut conn: Box<dyn Connection>) {
        if !self.enter_connected(generation, identity) {
            conn.close().await;
            return;
        }

        let rooms = Room::for_identity(identity);
        for room in &rooms {
            if let Err(e) = conn.send(&room.join_msg()).await {
                warn!(%room, error = %e, "room declaration failed");
                conn.close().await;
                return;
            }
            debug!(%room, "room declared");
        }
        if !self.record_rooms(generation, rooms) {
            conn.close().await;
            return;
        }

        while let Some(frame) = conn.recv().await {
            match frame {
                Ok(ServerMsg::Event(event)) => {
                    if !self.deliver(generation, &event) {
                        return;
                    }
                }
                Ok(ServerMsg::Ready) => debug!("ignoring repeated ready"),
                Ok(ServerMsg::Rejected { reason }) => {
                    warn!(%reason, "server ended the session");
                    break;
                }
                Err(ChannelError::Protocol(e)) => warn!(error = %e, "dropping malformed frame"),
                Err(e) => {
                    warn!(error = %e, "channel transport failed");
                    break;
                }
            }
        }
        conn.close().await;
    }

    fn enter_connected(&self, generation: u64, identity: &Identity) -> bool {
        let live = self.live.read();
        if *live != generation {
            return false;
        }
        self.state.send_replace(ChannelState::Connected);
        self.connectivity.send_replace(true);
        info!(subject_id = %identity.subject_id, "channel connected");
        true
    }

    fn record_rooms(&self, generation: u64, rooms: Vec<Room>) -> bool {
        let live = self.live.read();
        if *live != generation {
            return false;
        }
        self.session.lock().rooms = rooms;
        true
    }

    fn deliver(&self, generation: u64, event: &PushEvent) -> bool {
        let live = self.live.read();
        if *live != generation {
            return false;
        }
        self.dispatcher.on_event(event);
        true
    }

    fn mark_disconnected(&self, generation: u64) -> bool {
        let live = self.live.read();
        if *live != generation {
            return false;
        }
        self.session.lock().rooms.clear();
        self.connectivity.send_replace(false);
        let previous = self.state.send_replace(ChannelState::Reconnecting);
        if previous == ChannelState::Connected {
            info!("channel lost, reconnecting");
        }
        true
    }
}
