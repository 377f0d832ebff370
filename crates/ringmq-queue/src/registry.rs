//! Queue registry: handle table, server inbox and pending replies.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use ringmq_types::{CorrelationId, MsgId, NodeId, Packet, PacketKind, Role};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::QueueError;
use crate::wait::Wait;

/// Limits applied by the registry.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of simultaneously open handles.
    pub max_handles: usize,
    /// How long a request waits for its replies before its pending entry
    /// expires.
    pub reply_timeout: Duration,
}

impl QueueConfig {
    /// Create a config suitable for fast test execution.
    pub fn test_config() -> Self {
        Self {
            max_handles: 64,
            reply_timeout: Duration::from_secs(2),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_handles: 4096,
            reply_timeout: Duration::from_secs(30),
        }
    }
}

/// Handle values handed out by [`QueueRegistry::open`], shared by every
/// registry in the process.
static NEXT_MSGID: AtomicU64 = AtomicU64::new(1);

/// Correlation ids handed out by [`QueueRegistry::begin_request`].
static NEXT_CORRELATION: AtomicU64 = AtomicU64::new(1);

/// Routing key of a handle: `origin ++ msgid`.
///
/// All traffic of one handle hashes to the same server for a given ring
/// version.
pub fn routing_key(origin: &NodeId, msgid: MsgId) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..32].copy_from_slice(origin.as_bytes());
    key[32..].copy_from_slice(&msgid.to_bytes());
    key
}

/// Replies expected for one outstanding request.
#[derive(Debug)]
struct PendingReply {
    /// `None` until the dispatcher reports how many receivers enqueued the
    /// request.
    expected: Option<usize>,
    received: usize,
    deadline: Instant,
}

impl PendingReply {
    fn satisfied(&self) -> bool {
        matches!(self.expected, Some(n) if self.received >= n)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    buffer: VecDeque<Packet>,
    pending: HashMap<CorrelationId, PendingReply>,
    closed: bool,
}

/// One inbound queue with its own lock and wakeup.
struct Queue {
    id: MsgId,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Queue {
    fn new(id: MsgId) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("queue lock poisoned")
    }

    /// Mark closed, discard the buffer and wake every waiter.
    ///
    /// Returns the number of discarded packets.
    fn close(&self) -> usize {
        let discarded = {
            let mut state = self.lock();
            if state.closed {
                return 0;
            }
            state.closed = true;
            state.pending.clear();
            let n = state.buffer.len();
            state.buffer.clear();
            n
        };
        self.notify.notify_waiters();
        discarded
    }

    fn push(&self, packet: Packet) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueError::NotFound(self.id));
            }
            state.buffer.push_back(packet);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Block until `take` yields a result, the queue closes, or `wait`
    /// runs out.
    async fn wait_for<F>(&self, wait: Wait, mut take: F) -> Result<Packet, QueueError>
    where
        F: FnMut(&mut QueueState) -> Option<Result<Packet, QueueError>>,
    {
        let deadline = match wait {
            Wait::For(d) => Some(Instant::now() + d),
            Wait::Poll | Wait::Forever => None,
        };

        loop {
            // Register interest before inspecting the buffer so a push
            // between the check and the await is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if let Some(result) = take(&mut state) {
                    return result;
                }
            }

            match (wait, deadline) {
                (Wait::Poll, _) => return Err(QueueError::Timeout),
                (_, Some(deadline)) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(QueueError::Timeout);
                    }
                }
                (_, None) => notified.await,
            }
        }
    }
}

/// Per-runtime registry of message queues.
///
/// A server registry also owns the shared inbox that receives every
/// SEND/BROADCAST addressed to the server; REPLY packets land in the handle
/// named by their header.
pub struct QueueRegistry {
    owner: NodeId,
    role: Role,
    config: QueueConfig,
    handles: RwLock<HashMap<MsgId, Arc<Queue>>>,
    inbox: Option<Arc<Queue>>,
    shut_down: AtomicBool,
}

impl QueueRegistry {
    /// Create an empty registry for the node `owner`.
    pub fn new(owner: NodeId, role: Role, config: QueueConfig) -> Self {
        let inbox = (role == Role::Server).then(|| Queue::new(MsgId::INVALID));
        Self {
            owner,
            role,
            config,
            handles: RwLock::new(HashMap::new()),
            inbox,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Node this registry belongs to.
    pub fn owner(&self) -> NodeId {
        self.owner
    }

    /// Role of the owning node.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Return the registry's configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------

    /// Allocate a fresh handle with an empty buffer and pending table.
    ///
    /// Handle values come from a process-wide counter: they never collide
    /// with a handle of another registry and are never reused, so a stale
    /// reference cannot reach a queue opened later.
    pub fn open(&self) -> Result<MsgId, QueueError> {
        if self.is_shut_down() {
            return Err(QueueError::Closed);
        }
        let mut handles = self.handles.write().expect("handle table lock poisoned");
        if handles.len() >= self.config.max_handles {
            warn!(max = self.config.max_handles, "handle table exhausted");
            return Err(QueueError::ResourceExhausted {
                max: self.config.max_handles,
            });
        }
        let msgid = MsgId::new(NEXT_MSGID.fetch_add(1, Ordering::Relaxed));
        handles.insert(msgid, Queue::new(msgid));
        debug!(%msgid, open = handles.len(), "handle opened");
        Ok(msgid)
    }

    /// Close a handle, discarding buffered packets and waking its waiters.
    ///
    /// Returns the number of discarded packets.
    pub fn close(&self, msgid: MsgId) -> Result<usize, QueueError> {
        let queue = self
            .handles
            .write()
            .expect("handle table lock poisoned")
            .remove(&msgid)
            .ok_or(QueueError::InvalidHandle(msgid))?;
        let discarded = queue.close();
        debug!(%msgid, discarded, "handle closed");
        Ok(discarded)
    }

    /// Whether `msgid` names an open handle.
    pub fn is_open(&self, msgid: MsgId) -> bool {
        self.handles
            .read()
            .expect("handle table lock poisoned")
            .contains_key(&msgid)
    }

    /// Number of open handles.
    pub fn open_handles(&self) -> usize {
        self.handles.read().expect("handle table lock poisoned").len()
    }

    /// Number of packets buffered on a handle, or in the shared inbox for
    /// `None`.
    pub fn buffered(&self, msgid: Option<MsgId>) -> Result<usize, QueueError> {
        Ok(self.queue(msgid)?.lock().buffer.len())
    }

    // ------------------------------------------------------------------
    // Requests and replies
    // ------------------------------------------------------------------

    /// Register an outstanding request on `msgid` and allocate its
    /// correlation id.
    ///
    /// Fails with [`QueueError::InvalidHandle`] if the handle is closed; this
    /// is the point where a send on a concurrently closed handle is refused.
    pub fn begin_request(&self, msgid: MsgId) -> Result<CorrelationId, QueueError> {
        let queue = self.queue(Some(msgid))?;
        let mut state = queue.lock();
        if state.closed {
            return Err(QueueError::InvalidHandle(msgid));
        }
        let correlation = CorrelationId(NEXT_CORRELATION.fetch_add(1, Ordering::Relaxed));
        state.pending.insert(
            correlation,
            PendingReply {
                expected: None,
                received: 0,
                deadline: Instant::now() + self.config.reply_timeout,
            },
        );
        trace!(%msgid, %correlation, "request registered");
        Ok(correlation)
    }

    /// Record how many receivers enqueued a request.
    ///
    /// With zero receivers, or when every reply already arrived, the entry
    /// is discarded.
    pub fn settle_request(&self, msgid: MsgId, correlation: CorrelationId, receivers: usize) {
        let Ok(queue) = self.queue(Some(msgid)) else {
            return;
        };
        let mut state = queue.lock();
        let done = match state.pending.get_mut(&correlation) {
            Some(entry) => {
                entry.expected = Some(receivers);
                entry.satisfied()
            }
            None => false,
        };
        if done {
            state.pending.remove(&correlation);
        }
    }

    /// Drop a pending request, e.g. after its dispatch failed.
    pub fn cancel_request(&self, msgid: MsgId, correlation: CorrelationId) {
        if let Ok(queue) = self.queue(Some(msgid)) {
            queue.lock().pending.remove(&correlation);
        }
    }

    /// Number of requests on `msgid` still waiting for replies.
    pub fn pending_requests(&self, msgid: MsgId) -> Result<usize, QueueError> {
        Ok(self.queue(Some(msgid))?.lock().pending.len())
    }

    /// Discard pending entries whose deadline has passed.
    ///
    /// Returns the number of expired entries. Replies arriving for them
    /// afterwards are dropped.
    pub fn expire_pending(&self, now: Instant) -> usize {
        let queues: Vec<Arc<Queue>> = self
            .handles
            .read()
            .expect("handle table lock poisoned")
            .values()
            .cloned()
            .collect();

        let mut expired = 0;
        for queue in queues {
            let mut state = queue.lock();
            let before = state.pending.len();
            state.pending.retain(|_, entry| entry.deadline > now);
            let n = before - state.pending.len();
            if n > 0 {
                debug!(msgid = %queue.id, expired = n, "pending replies expired");
            }
            expired += n;
        }
        expired
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    /// Append an inbound packet to the queue it is addressed to.
    ///
    /// SEND and BROADCAST go to the shared inbox (servers only); REPLY goes
    /// to the handle named in the header and must match a pending request.
    /// [`QueueError::NotFound`] and [`QueueError::UnknownCorrelation`] mean
    /// the packet was dropped.
    pub fn enqueue(&self, packet: Packet) -> Result<(), QueueError> {
        let header = &packet.header;
        match header.kind {
            PacketKind::Send | PacketKind::Broadcast => {
                let inbox = self
                    .inbox
                    .as_ref()
                    .ok_or(QueueError::NotFound(header.msgid))?;
                trace!(sender = %header.sender, msgid = %header.msgid, correlation = %header.correlation_id, "request enqueued");
                inbox.push(packet)
            }
            PacketKind::Reply => {
                let msgid = header.msgid;
                let correlation = header.correlation_id;
                let queue = self
                    .queue(Some(msgid))
                    .map_err(|_| QueueError::NotFound(msgid))?;
                {
                    let mut state = queue.lock();
                    if state.closed {
                        return Err(QueueError::NotFound(msgid));
                    }
                    let now = Instant::now();
                    let (expired, done) = match state.pending.get_mut(&correlation) {
                        None => {
                            debug!(%msgid, %correlation, "late or unknown reply dropped");
                            return Err(QueueError::UnknownCorrelation(correlation));
                        }
                        Some(entry) if entry.deadline <= now => (true, true),
                        Some(entry) => {
                            entry.received += 1;
                            (false, entry.satisfied())
                        }
                    };
                    if done {
                        state.pending.remove(&correlation);
                    }
                    if expired {
                        debug!(%msgid, %correlation, "reply after deadline dropped");
                        return Err(QueueError::UnknownCorrelation(correlation));
                    }
                    state.buffer.push_back(packet);
                }
                queue.notify.notify_waiters();
                Ok(())
            }
            PacketKind::Admin => Err(QueueError::NotFound(header.msgid)),
        }
    }

    /// Take the oldest packet from a handle, or from the shared inbox for
    /// `None`.
    pub async fn dequeue(&self, msgid: Option<MsgId>, wait: Wait) -> Result<Packet, QueueError> {
        let queue = self.queue(msgid)?;
        queue
            .wait_for(wait, |state| state.buffer.pop_front().map(Ok))
            .await
    }

    /// Take the first reply to `correlation` from a handle, leaving other
    /// packets in place.
    ///
    /// Fails with [`QueueError::UnknownCorrelation`] once the request is
    /// neither pending nor has a buffered reply.
    pub async fn dequeue_reply(
        &self,
        msgid: MsgId,
        correlation: CorrelationId,
        wait: Wait,
    ) -> Result<Packet, QueueError> {
        let queue = self.queue(Some(msgid))?;
        queue
            .wait_for(wait, |state| {
                let found = state.buffer.iter().position(|p| {
                    p.header.kind == PacketKind::Reply && p.header.correlation_id == correlation
                });
                match found.and_then(|i| state.buffer.remove(i)) {
                    Some(packet) => Some(Ok(packet)),
                    None if !state.pending.contains_key(&correlation) => {
                        Some(Err(QueueError::UnknownCorrelation(correlation)))
                    }
                    None => None,
                }
            })
            .await
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Close every handle and the inbox, waking all waiters with
    /// [`QueueError::Closed`]. Later `open` calls fail.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let queues: Vec<Arc<Queue>> = self
            .handles
            .write()
            .expect("handle table lock poisoned")
            .drain()
            .map(|(_, q)| q)
            .collect();
        let count = queues.len();
        for queue in queues {
            queue.close();
        }
        if let Some(inbox) = &self.inbox {
            inbox.close();
        }
        debug!(owner = %self.owner, handles = count, "queue registry shut down");
    }

    /// Whether [`QueueRegistry::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn queue(&self, msgid: Option<MsgId>) -> Result<Arc<Queue>, QueueError> {
        match msgid {
            None => self
                .inbox
                .clone()
                .ok_or(QueueError::InvalidHandle(MsgId::INVALID)),
            Some(msgid) => self
                .handles
                .read()
                .expect("handle table lock poisoned")
                .get(&msgid)
                .cloned()
                .ok_or(QueueError::InvalidHandle(msgid)),
        }
    }
}

impl std::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("owner", &self.owner)
            .field("role", &self.role)
            .field("open_handles", &self.open_handles())
            .finish_non_exhaustive()
    }
}
