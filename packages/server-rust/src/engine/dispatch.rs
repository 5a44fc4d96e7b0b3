//! Dispatch engine: launches origin ops, routes inbound messages to live ops
//! or to freshly built target ops, and shuts down cleanly.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use opflow_core::{Allocator, Mailbox, NodeId, OpMessage, OpTypeId, PeerHandle};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info_span, Instrument};

use super::config::EngineConfig;
use super::lifecycle::{EngineState, Lifecycle};
use super::mailbox::{LiveOpInfo, MailboxEvent, MailboxTable};
use super::runner::OpRunner;
use super::stats::{EngineStats, StatsSnapshot};
use crate::op::operation::OpCell;
use crate::op::{Op, OpEvent, OpRegistration, OpRegistry, RegisteredOp, RegistryError, Role};
use crate::traits::{Transport, TransportAttachment};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned synchronously by engine calls. Routing problems with
/// remote messages never surface here; they are logged and dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("engine is not running (state: {state:?})")]
    NotRunning { state: EngineState },
    #[error("engine is poisoned by an earlier invariant violation")]
    Poisoned,
    #[error("live operation limit of {limit} reached")]
    Overloaded { limit: usize },
    #[error("invalid configuration: {0}")]
    Configuration(RegistryError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("engine must be started from within a tokio runtime")]
    NoRuntime,
    #[error("no live operation at {0}")]
    UnknownMailbox(Mailbox),
}

// ---------------------------------------------------------------------------
// EngineShared
// ---------------------------------------------------------------------------

/// State shared by the engine handle, the inbound loop, and every runner.
pub(crate) struct EngineShared {
    pub(crate) node: NodeId,
    pub(crate) config: EngineConfig,
    pub(crate) registry: OpRegistry,
    pub(crate) mailboxes: MailboxTable,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) allocator: Allocator,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) stats: EngineStats,
    pub(crate) limiter: Arc<Semaphore>,
    pub(crate) runtime: Handle,
    inbound_task: Mutex<Option<JoinHandle<()>>>,
}

impl EngineShared {
    fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.limiter).try_acquire_owned().ok()
    }

    fn spawn_op(
        self: &Arc<Self>,
        op: Box<dyn Op>,
        role: Role,
        permit: OwnedSemaphorePermit,
        initial: Option<OpEvent>,
        first_message: Option<OpMessage>,
    ) -> Mailbox {
        let (tx, rx) = mpsc::unbounded_channel();
        let entry = self
            .mailboxes
            .register(op.op_type_id(), op.op_type_name(), role, tx);
        if let Some(msg) = first_message {
            // The receiver is alive: it is handed to the runner right below.
            let _ = entry.tx.send(MailboxEvent::Message(msg));
        }
        let mailbox = entry.mailbox;
        OpRunner::spawn(self, OpCell::new(op, role), entry, rx, permit, initial);
        mailbox
    }

    /// Routes one inbound message. Never fails: every routing problem is
    /// logged, counted, and dropped.
    fn route_inbound(self: &Arc<Self>, msg: OpMessage) {
        if msg.starts_conversation() {
            self.start_target(msg);
            return;
        }

        let Some(entry) = self.mailboxes.get(msg.dst_mailbox) else {
            self.stats.record_unmatched();
            tracing::warn!(
                dst_mailbox = %msg.dst_mailbox,
                op_id = %msg.op_id,
                src_node = %msg.src_node,
                "dropping message for unknown mailbox"
            );
            return;
        };
        if entry.op_id != msg.op_id {
            self.stats.record_stale();
            tracing::warn!(
                dst_mailbox = %msg.dst_mailbox,
                op_id = %msg.op_id,
                live_op = entry.op_name,
                "dropping message addressed to a different operation"
            );
            return;
        }
        let dst = msg.dst_mailbox;
        if entry.tx.send(MailboxEvent::Message(msg)).is_err() {
            self.stats.record_unmatched();
            tracing::warn!(dst_mailbox = %dst, "mailbox has no live operation; dropping message");
        }
    }

    fn start_target(self: &Arc<Self>, msg: OpMessage) {
        let state = self.lifecycle.state();
        if state != EngineState::Running {
            self.stats.record_refused();
            tracing::debug!(?state, op_id = %msg.op_id, "refusing new conversation");
            return;
        }
        let registration = match self.registry.lookup(msg.op_id) {
            Ok(registration) => registration,
            Err(err) => {
                self.stats.record_unknown_op();
                tracing::warn!(
                    op_id = %msg.op_id,
                    src_node = %msg.src_node,
                    src_mailbox = %msg.src_mailbox,
                    %err,
                    "dropping message for unregistered operation"
                );
                return;
            }
        };
        let Some(permit) = self.try_admit() else {
            self.stats.record_refused();
            tracing::warn!(
                op = registration.name(),
                limit = self.config.max_live_ops,
                "live operation limit reached; dropping new conversation"
            );
            return;
        };

        self.stats.record_target_created(registration.name());
        let op = registration.create();
        let mailbox = self.spawn_op(op, Role::Target, permit, None, Some(msg));
        tracing::debug!(op = registration.name(), %mailbox, "target created");
    }
}

/// Routes inbound messages until the engine terminates. `terminate` must be
/// subscribed before the task is spawned so an early terminate is not missed.
async fn inbound_loop(
    shared: Arc<EngineShared>,
    mut inbound: mpsc::UnboundedReceiver<OpMessage>,
    mut terminate: watch::Receiver<bool>,
) {
    if *terminate.borrow_and_update() {
        return;
    }
    loop {
        tokio::select! {
            biased;
            _ = terminate.changed() => break,
            received = inbound.recv() => match received {
                Some(msg) => shared.route_inbound(msg),
                None => {
                    tracing::info!("transport closed inbound channel");
                    break;
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// EngineBuilder
// ---------------------------------------------------------------------------

/// Collects configuration and pre-start registrations.
///
/// Registration errors are recorded and reported by `start()`, which refuses
/// to build an engine with a bad configuration.
#[derive(Debug, Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    registry: OpRegistry,
    errors: Vec<RegistryError>,
}

impl EngineBuilder {
    /// Empty builder with `config` and no registered protocols.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: OpRegistry::new(),
            errors: Vec::new(),
        }
    }

    /// Registers `T` under its `OP_ID` and `OP_NAME`.
    #[must_use]
    pub fn register_op<T: RegisteredOp>(self) -> Self {
        self.register(OpRegistration::of::<T>())
    }

    /// Registers a protocol. A failure is kept and returned by `start`.
    #[must_use]
    pub fn register(mut self, registration: OpRegistration) -> Self {
        if let Err(err) = self.registry.register(registration) {
            tracing::error!(%err, "operation registration failed");
            self.errors.push(err);
        }
        self
    }

    /// Starts the engine on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Configuration` if any registration failed, and
    /// `EngineError::NoRuntime` outside a tokio runtime.
    pub fn start(mut self, attachment: TransportAttachment) -> Result<Engine, EngineError> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(EngineError::Configuration(err));
        }
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        self.registry.seal();

        let TransportAttachment {
            transport,
            inbound,
            memory,
        } = attachment;
        let node = transport.local_node();
        let allocator = Allocator::new(memory, self.config.allocator_capacity_bytes);
        let limiter = Arc::new(Semaphore::new(self.config.max_live_ops));

        let shared = Arc::new(EngineShared {
            node,
            config: self.config,
            registry: self.registry,
            mailboxes: MailboxTable::new(),
            transport,
            allocator,
            lifecycle: Lifecycle::new(),
            stats: EngineStats::default(),
            limiter,
            runtime,
            inbound_task: Mutex::new(None),
        });

        let terminate = shared.lifecycle.terminate_receiver();
        let task = shared.runtime.spawn(
            inbound_loop(Arc::clone(&shared), inbound, terminate)
                .instrument(info_span!("inbound", %node)),
        );
        *shared.inbound_task.lock() = Some(task);
        shared.lifecycle.set_running();

        tracing::info!(
            %node,
            ops = ?shared.registry.entries(),
            max_live_ops = shared.config.max_live_ops,
            "engine started"
        );
        Ok(Engine {
            _handles: Arc::new(HandleGuard {
                shared: Arc::clone(&shared),
            }),
            shared,
        })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Returned by `launch`. The op's result travels separately through the
/// `ResultFuture` handed out by its constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchHandle {
    pub mailbox: Mailbox,
    pub op_id: OpTypeId,
    pub op_name: &'static str,
}

/// Handle to a running engine. Cheap to clone.
///
/// Dropping the last handle without `shutdown` terminates the engine: live
/// ops are abandoned and the inbound task is aborted.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
    _handles: Arc<HandleGuard>,
}

/// Shared by every `Engine` clone. Runners and the inbound task hold
/// `EngineShared` directly, so this is the only count of user handles.
struct HandleGuard {
    shared: Arc<EngineShared>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        let lifecycle = &self.shared.lifecycle;
        if lifecycle.begin_drain() {
            tracing::warn!(
                node = %self.shared.node,
                live = lifecycle.live_count(),
                "engine dropped without shutdown; terminating"
            );
            lifecycle.mark_stopped();
        }
        lifecycle.terminate();
        if let Some(task) = self.shared.inbound_task.lock().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("node", &self.shared.node)
            .field("state", &self.state())
            .field("live_ops", &self.live_count())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Starts configuring an engine. Equivalent to `EngineBuilder::new`.
    #[must_use]
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Hands an origin op to the engine and returns immediately. The op's
    /// first transition runs on the engine's runtime.
    ///
    /// # Errors
    ///
    /// Returns `NotRunning`/`Poisoned` when the engine does not accept work,
    /// and `Overloaded` when `max_live_ops` ops are already live.
    pub fn launch<O: Op>(&self, op: O) -> Result<LaunchHandle, EngineError> {
        match self.shared.lifecycle.state() {
            EngineState::Running => {}
            EngineState::Poisoned => return Err(EngineError::Poisoned),
            state => return Err(EngineError::NotRunning { state }),
        }
        let permit = self.shared.try_admit().ok_or(EngineError::Overloaded {
            limit: self.shared.config.max_live_ops,
        })?;

        let op_id = op.op_type_id();
        let op_name = op.op_type_name();
        self.shared.stats.record_launch(op_name);
        let mailbox =
            self.shared
                .spawn_op(Box::new(op), Role::Origin, permit, Some(OpEvent::Start), None);
        tracing::debug!(op = op_name, %mailbox, "operation launched");
        Ok(LaunchHandle {
            mailbox,
            op_id,
            op_name,
        })
    }

    /// Routes a message as if it had arrived from the transport. Safe to call
    /// from any thread.
    pub fn deliver(&self, msg: OpMessage) {
        self.shared.route_inbound(msg);
    }

    /// Delivers local input to a live op as an `OpEvent::UserTrigger`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownMailbox` if no op is live at `mailbox`.
    pub fn trigger(&self, mailbox: Mailbox, payload: impl Into<Bytes>) -> Result<(), EngineError> {
        let entry = self
            .shared
            .mailboxes
            .get(mailbox)
            .ok_or(EngineError::UnknownMailbox(mailbox))?;
        entry
            .tx
            .send(MailboxEvent::Trigger(payload.into()))
            .map_err(|_| EngineError::UnknownMailbox(mailbox))
    }

    /// Registers a protocol while running.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Registry` on a duplicate id or name.
    pub fn register_live(&self, registration: OpRegistration) -> Result<(), EngineError> {
        Ok(self.shared.registry.register_live(registration)?)
    }

    /// # Errors
    ///
    /// See [`Engine::register_live`].
    pub fn register_live_op<T: RegisteredOp>(&self) -> Result<(), EngineError> {
        self.register_live(OpRegistration::of::<T>())
    }

    /// Node this engine runs on, as reported by its transport.
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.shared.node
    }

    /// Handle for `node`, if the transport knows it. Pass it to protocol
    /// constructors.
    #[must_use]
    pub fn peer(&self, node: NodeId) -> Option<PeerHandle> {
        self.shared.transport.peer(node)
    }

    /// Node-local allocator. Buffers that protocols pin come from here.
    #[must_use]
    pub fn allocator(&self) -> &Allocator {
        &self.shared.allocator
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.shared.lifecycle.state()
    }

    /// Registered protocols, sorted by name.
    #[must_use]
    pub fn registered_ops(&self) -> Vec<(OpTypeId, &'static str)> {
        self.shared.registry.entries()
    }

    /// Snapshot of every live operation, sorted by mailbox.
    #[must_use]
    pub fn live_ops(&self) -> Vec<LiveOpInfo> {
        self.shared.mailboxes.snapshot()
    }

    /// Number of live operations. An op counts until it is destroyed.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.shared.mailboxes.len()
    }

    /// Point-in-time copy of the engine counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Stops accepting new work, waits up to `timeout` for live ops to
    /// finish, then terminates whatever is left. Consumers of abandoned ops
    /// see `OpError::Abandoned`. Returns `true` if every op finished on its
    /// own.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let lifecycle = &self.shared.lifecycle;
        if !lifecycle.begin_drain() {
            tracing::debug!(state = ?lifecycle.state(), "shutdown requested while not running");
            return lifecycle.live_count() == 0;
        }
        tracing::info!(
            node = %self.shared.node,
            live = lifecycle.live_count(),
            "draining engine"
        );

        let drained = lifecycle.wait_for_drain(timeout).await;
        if !drained {
            tracing::warn!(
                remaining = lifecycle.live_count(),
                "drain timed out; abandoning remaining operations"
            );
        }
        lifecycle.terminate();
        let task = self.shared.inbound_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        if !drained {
            lifecycle.wait_for_drain(Duration::from_secs(1)).await;
        }
        lifecycle.mark_stopped();
        tracing::info!(node = %self.shared.node, drained, "engine stopped");
        drained
    }

    /// `shutdown` with the configured drain timeout.
    pub async fn shutdown_default(&self) -> bool {
        self.shutdown(self.shared.config.shutdown_drain_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use opflow_core::MemoryRegistry;

    use super::*;
    use crate::op::operation::tests::RecordingTransport;
    use crate::op::{CreateAsTarget, OpContext, WaitingType};

    /// Target that parks until a user trigger arrives.
    struct ParkedOp;

    static PARKED_DROPS: AtomicUsize = AtomicUsize::new(0);

    impl Drop for ParkedOp {
        fn drop(&mut self) {
            PARKED_DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl RegisteredOp for ParkedOp {
        const OP_ID: OpTypeId = OpTypeId::from_name("ParkedOp");
        const OP_NAME: &'static str = "ParkedOp";

        fn create_as_target(_marker: CreateAsTarget) -> Self {
            ParkedOp
        }
    }

    impl Op for ParkedOp {
        fn op_type_id(&self) -> OpTypeId {
            Self::OP_ID
        }

        fn op_type_name(&self) -> &'static str {
            Self::OP_NAME
        }

        fn update_origin(&mut self, event: OpEvent, _ctx: &mut OpContext<'_>) -> WaitingType {
            match event {
                OpEvent::UserTrigger(_) => WaitingType::DoneAndDestroy,
                _ => WaitingType::WaitOnUser,
            }
        }

        fn update_target(&mut self, event: OpEvent, ctx: &mut OpContext<'_>) -> WaitingType {
            self.update_origin(event, ctx)
        }

        fn state_name(&self) -> &'static str {
            "parked"
        }
    }

    fn attachment() -> (TransportAttachment, mpsc::UnboundedSender<OpMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let attachment = TransportAttachment {
            transport: Arc::new(RecordingTransport::default()),
            inbound: rx,
            memory: MemoryRegistry::new(NodeId(1)),
        };
        (attachment, tx)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn start_outside_runtime_fails() {
        let (attachment, _tx) = attachment();
        let err = Engine::builder(EngineConfig::default())
            .start(attachment)
            .unwrap_err();
        assert_eq!(err, EngineError::NoRuntime);
    }

    #[tokio::test]
    async fn duplicate_registration_prevents_start() {
        let (attachment, _tx) = attachment();
        let err = Engine::builder(EngineConfig::default())
            .register_op::<ParkedOp>()
            .register_op::<ParkedOp>()
            .start(attachment)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Configuration(RegistryError::DuplicateId { .. })
        ));
    }

    #[tokio::test]
    async fn trigger_finishes_parked_op() {
        let (attachment, _tx) = attachment();
        let engine = Engine::builder(EngineConfig::default())
            .start(attachment)
            .unwrap();

        let handle = engine.launch(ParkedOp).unwrap();
        assert_eq!(engine.live_count(), 1);
        wait_until(|| engine.live_ops().first().is_some_and(|i| i.state == "parked")).await;

        engine.trigger(handle.mailbox, "go").unwrap();
        wait_until(|| engine.live_count() == 0).await;
        assert_eq!(engine.stats().retired, 1);
        assert_eq!(
            engine.trigger(handle.mailbox, "again").unwrap_err(),
            EngineError::UnknownMailbox(handle.mailbox)
        );
    }

    #[tokio::test]
    async fn launch_beyond_limit_is_overloaded() {
        let (attachment, _tx) = attachment();
        let config = EngineConfig {
            max_live_ops: 1,
            ..EngineConfig::default()
        };
        let engine = Engine::builder(config).start(attachment).unwrap();

        let first = engine.launch(ParkedOp).unwrap();
        assert_eq!(
            engine.launch(ParkedOp).unwrap_err(),
            EngineError::Overloaded { limit: 1 }
        );

        engine.trigger(first.mailbox, Bytes::new()).unwrap();
        wait_until(|| engine.live_count() == 0).await;
        assert!(engine.launch(ParkedOp).is_ok());
    }

    #[tokio::test]
    async fn inbound_conversation_creates_target() {
        let (attachment, tx) = attachment();
        let engine = Engine::builder(EngineConfig::default())
            .register_op::<ParkedOp>()
            .start(attachment)
            .unwrap();

        tx.send(OpMessage {
            op_id: ParkedOp::OP_ID,
            src_node: NodeId(2),
            src_mailbox: Mailbox(4),
            dst_mailbox: Mailbox::NONE,
            flags: 0,
            body: Bytes::new(),
            remote: None,
        })
        .unwrap();

        wait_until(|| engine.live_count() == 1).await;
        let info = engine.live_ops().remove(0);
        assert_eq!(info.role, Role::Target);
        assert_eq!(info.op_name, "ParkedOp");
        assert_eq!(engine.stats().targets_created, 1);
    }

    #[tokio::test]
    async fn shutdown_abandons_parked_ops() {
        let (attachment, _tx) = attachment();
        let engine = Engine::builder(EngineConfig::default())
            .start(attachment)
            .unwrap();
        let before = PARKED_DROPS.load(Ordering::SeqCst);
        engine.launch(ParkedOp).unwrap();

        let drained = engine.shutdown(Duration::from_millis(50)).await;
        assert!(!drained);
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(engine.live_count(), 0);
        assert!(PARKED_DROPS.load(Ordering::SeqCst) > before);
        assert_eq!(engine.stats().abandoned, 1);
        assert!(matches!(
            engine.launch(ParkedOp),
            Err(EngineError::NotRunning {
                state: EngineState::Stopped
            })
        ));
    }

    #[tokio::test]
    async fn shutdown_right_after_start_completes() {
        let (attachment, _tx) = attachment();
        let engine = Engine::builder(EngineConfig::default())
            .start(attachment)
            .unwrap();

        let drained = tokio::time::timeout(
            Duration::from_secs(3),
            engine.shutdown(Duration::from_millis(100)),
        )
        .await;
        assert_eq!(drained, Ok(true));
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_right_after_start_completes_on_multi_thread() {
        for _ in 0..20 {
            let (attachment, _tx) = attachment();
            let engine = Engine::builder(EngineConfig::default())
                .start(attachment)
                .unwrap();
            let drained = tokio::time::timeout(
                Duration::from_secs(3),
                engine.shutdown(Duration::from_millis(100)),
            )
            .await
            .expect("shutdown hung");
            assert!(drained);
        }
    }

    /// Finishes on a user trigger and takes a while to drop.
    struct SlowDropOp {
        drop_started: Arc<AtomicBool>,
        drop_done: Arc<AtomicBool>,
    }

    impl Drop for SlowDropOp {
        fn drop(&mut self) {
            self.drop_started.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            self.drop_done.store(true, Ordering::SeqCst);
        }
    }

    impl Op for SlowDropOp {
        fn op_type_id(&self) -> OpTypeId {
            OpTypeId::from_name("SlowDropOp")
        }

        fn op_type_name(&self) -> &'static str {
            "SlowDropOp"
        }

        fn update_origin(&mut self, event: OpEvent, _ctx: &mut OpContext<'_>) -> WaitingType {
            match event {
                OpEvent::UserTrigger(_) => WaitingType::DoneAndDestroy,
                _ => WaitingType::WaitOnUser,
            }
        }

        fn update_target(&mut self, event: OpEvent, ctx: &mut OpContext<'_>) -> WaitingType {
            self.update_origin(event, ctx)
        }

        fn state_name(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mailbox_not_reused_while_op_is_destroyed() {
        let (attachment, _tx) = attachment();
        let engine = Engine::builder(EngineConfig::default())
            .start(attachment)
            .unwrap();

        let drop_started = Arc::new(AtomicBool::new(false));
        let drop_done = Arc::new(AtomicBool::new(false));
        let slow = engine
            .launch(SlowDropOp {
                drop_started: Arc::clone(&drop_started),
                drop_done: Arc::clone(&drop_done),
            })
            .unwrap();
        engine.trigger(slow.mailbox, "finish").unwrap();
        wait_until(|| drop_started.load(Ordering::SeqCst)).await;

        let next = engine.launch(ParkedOp).unwrap();
        assert!(!drop_done.load(Ordering::SeqCst));
        assert_ne!(next.mailbox, slow.mailbox);

        wait_until(|| drop_done.load(Ordering::SeqCst)).await;
        engine.trigger(next.mailbox, Bytes::new()).unwrap();
        wait_until(|| engine.live_count() == 0).await;
    }

    #[tokio::test]
    async fn dropping_last_handle_terminates_engine() {
        let (attachment, _tx) = attachment();
        let engine = Engine::builder(EngineConfig::default())
            .start(attachment)
            .unwrap();
        let before = PARKED_DROPS.load(Ordering::SeqCst);
        engine.launch(ParkedOp).unwrap();
        wait_until(|| engine.live_ops().first().is_some_and(|i| i.state == "parked")).await;

        let shared = Arc::downgrade(&engine.shared);
        let copy = engine.clone();
        drop(engine);
        assert_eq!(copy.state(), EngineState::Running);

        drop(copy);
        wait_until(|| shared.upgrade().is_none()).await;
        assert!(PARKED_DROPS.load(Ordering::SeqCst) > before);
    }
}
