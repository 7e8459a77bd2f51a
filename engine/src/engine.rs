use crate::{ControlMessage, TaskInvocation, TaskRegistry};
use mojo_store::{StoreError, Subscription};
use mojo_tasks::{
    unix_now, RunnerDescriptor, RunnerStatus, TaskManager, TaskManagerError, TaskStatus,
};
use std::sync::{
    atomic::{AtomicU8, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Channel every runner subscribes to in addition to its own.
pub const BROADCAST_CHANNEL: &str = "broadcast";

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("manager error: {0}")]
    Manager(#[from] TaskManagerError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Best-effort hostname of this process, the default runner identity.
pub fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}

#[derive(Debug, Clone)]
pub struct EngineOpts {
    /// User channels to consume. `broadcast` and the per-host channel are
    /// always added on top.
    pub channels: Vec<String>,
    pub max_workers: usize,
    pub hostname: String,
    /// Seconds between heartbeats. Keep at or below half the liveness
    /// threshold so a healthy runner is never mistaken for dead.
    pub heartbeat_interval: u64,
    /// Runner entries older than this are purged from the registry.
    /// Must exceed the liveness threshold.
    pub stale_threshold: u64,
}

impl Default for EngineOpts {
    fn default() -> Self {
        Self {
            channels: vec![],
            max_workers: 5,
            hostname: default_hostname(),
            heartbeat_interval: 15,
            stale_threshold: 120,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::Starting,
            1 => EngineState::Running,
            2 => EngineState::Draining,
            _ => EngineState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            EngineState::Starting => 0,
            EngineState::Running => 1,
            EngineState::Draining => 2,
            EngineState::Stopped => 3,
        }
    }
}

/// One runner process. Cloning hands out another handle to the same engine.
///
/// The subscription loop stays single-threaded and never blocks on task
/// execution: ids are handed to a pool bounded by `max_workers`, and
/// submissions past the bound wait their turn in an unbounded buffer.
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    manager: TaskManager,
    registry: Arc<TaskRegistry>,
    opts: EngineOpts,
    /// User channels plus `broadcast` plus `runner_<hostname>`.
    channels: Vec<String>,
    semaphore: Arc<Semaphore>,
    /// Tasks currently executing a handler.
    active: AtomicUsize,
    /// Tasks submitted to the pool and not yet finished, executing or not.
    in_flight: AtomicUsize,
    state: AtomicU8,
    started_at: i64,
    shutdown: CancellationToken,
}

impl TaskEngine {
    pub fn new(manager: TaskManager, registry: Arc<TaskRegistry>, opts: EngineOpts) -> Self {
        let mut channels = opts.channels.clone();
        let runner_channel = format!("runner_{}", opts.hostname);
        if !channels.iter().any(|channel| channel == BROADCAST_CHANNEL) {
            channels.push(BROADCAST_CHANNEL.to_string());
        }
        if !channels.contains(&runner_channel) {
            channels.push(runner_channel);
        }
        let semaphore = Arc::new(Semaphore::new(opts.max_workers));
        Self {
            inner: Arc::new(EngineInner {
                manager,
                registry,
                channels,
                semaphore,
                active: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                state: AtomicU8::new(EngineState::Starting.as_u8()),
                started_at: unix_now(),
                shutdown: CancellationToken::new(),
                opts,
            }),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.inner.opts.hostname
    }

    pub fn channels(&self) -> &[String] {
        &self.inner.channels
    }

    pub fn runner_channel(&self) -> String {
        format!("runner_{}", self.inner.opts.hostname)
    }

    pub fn manager(&self) -> &TaskManager {
        &self.inner.manager
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: EngineState) {
        self.inner.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Register, recover orphaned work, then consume messages until
    /// [`shutdown`](Self::shutdown) is called. Reconnects and re-scans the
    /// pending backlog whenever the subscription drops.
    pub async fn run(&self) -> EngineResult<()> {
        info!(
            hostname = %self.inner.opts.hostname,
            channels = ?self.inner.channels,
            max_workers = self.inner.opts.max_workers,
            "task engine starting"
        );

        self.update_runner_status().await?;
        self.inner.manager.take_out_the_dead().await?;
        self.reset_running_tasks().await?;
        self.set_state(EngineState::Running);

        let heartbeat = self.clone();
        tokio::spawn(async move { heartbeat.heartbeat_loop().await });

        let topics: Vec<String> = self
            .inner
            .channels
            .iter()
            .map(|channel| self.inner.manager.channel_topic(channel))
            .collect();

        while !self.inner.shutdown.is_cancelled() {
            let mut subscription = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                subscription = self.subscribe_with_backoff(&topics) => subscription,
            };

            if let Err(e) = self.queue_pending_tasks().await {
                warn!("failed to queue pending backlog: {e}");
            }

            loop {
                tokio::select! {
                    _ = self.inner.shutdown.cancelled() => return Ok(()),
                    message = subscription.next_message() => match message {
                        Ok(Some((_topic, payload))) => self.handle_message(&payload).await,
                        Ok(None) => {
                            warn!("subscription closed, reconnecting");
                            break;
                        }
                        Err(e) => {
                            warn!("subscription failed: {e}, reconnecting");
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn subscribe_with_backoff(&self, topics: &[String]) -> Subscription {
        let mut delay = Duration::from_secs(1);
        loop {
            match self.inner.manager.store().subscribe(topics).await {
                Ok(subscription) => return subscription,
                Err(e) => {
                    error!("subscribe failed: {e}, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(30));
                }
            }
        }
    }

    /// Route one raw pub/sub payload: a parseable control message is
    /// dispatched, anything else is a task id.
    pub async fn handle_message(&self, payload: &[u8]) {
        if let Some(message) = ControlMessage::parse(payload) {
            match message {
                ControlMessage::Ping { from, .. } => {
                    if let Err(e) = self.handle_ping_request(&from).await {
                        warn!(%from, "failed to answer ping: {e}");
                    }
                }
                ControlMessage::PingResponse { from, status, .. } => {
                    if let Err(e) = self.handle_ping_response(&from, status).await {
                        warn!(%from, "failed to record ping response: {e}");
                    }
                }
            }
            return;
        }

        match std::str::from_utf8(payload) {
            Ok(id) => self.queue_task(id.trim().to_string()),
            Err(_) => warn!("dropping non-utf8 message payload"),
        }
    }

    /// Submit a task id to the worker pool. Never blocks the caller: the
    /// spawned submission waits for a worker slot on its own.
    pub fn queue_task(&self, id: String) {
        if self.state() != EngineState::Running {
            debug!(%id, "engine not accepting tasks, dropping submission");
            return;
        }
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let engine = self.clone();
        tokio::spawn(async move {
            let permit = match engine.inner.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    engine.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            };
            engine.inner.active.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = engine.on_run_task(&id).await {
                error!(%id, "task bookkeeping failed: {e}");
            }
            engine.inner.active.fetch_sub(1, Ordering::SeqCst);
            engine.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        });
    }

    /// Execute one task end to end: claim it out of pending, run the
    /// registered handler, and settle the record into completed or errors.
    pub async fn on_run_task(&self, id: &str) -> EngineResult<()> {
        let manager = &self.inner.manager;

        let Some(mut task) = manager.get_task(id).await? else {
            warn!(id, "task record missing, dropping");
            return Ok(());
        };
        if task.status.is_terminal() {
            debug!(id, status = %task.status, "task already settled, dropping");
            return Ok(());
        }

        let now = unix_now();
        let channel = task.channel.clone();
        if task.is_expired(now) {
            // the atomic removal arbitrates racing runners; losers must not
            // append a second error entry
            if manager.remove_from_pending(id, &channel).await? == 0 {
                return Ok(());
            }
            manager.add_to_errors(&mut task, "expired").await?;
            mojo_metrics::inc_tasks_failed(&channel);
            warn!(id, %channel, "refusing to start expired task");
            return Ok(());
        }

        if !manager.claim_pending(id, &channel).await? {
            debug!(id, %channel, "task not in pending, another runner claimed it");
            return Ok(());
        }
        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        task.runner = Some(self.inner.opts.hostname.clone());
        manager.save_task(&task, None).await?;
        debug!(id, %channel, function = %task.function, "task running");

        mojo_metrics::inc_tasks_in_flight(&channel);
        let outcome = match self.inner.registry.resolve(&task.function) {
            None => Err(format!("unresolvable function: {}", task.function)),
            Some(handler) => {
                let handle = tokio::spawn(handler(TaskInvocation::from(&task)));
                match handle.await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(e) if e.is_panic() => Err(format!("task panicked: {e}")),
                    Err(e) => Err(format!("task aborted: {e}")),
                }
            }
        };
        mojo_metrics::dec_tasks_in_flight(&channel);

        manager.remove_from_running(id, &channel).await?;
        match outcome {
            Ok(()) => {
                manager.add_to_completed(&mut task).await?;
                mojo_metrics::inc_tasks_completed(&channel);
                info!(id, %channel, function = %task.function, "task completed");
            }
            Err(message) => {
                manager.add_to_errors(&mut task, &message).await?;
                mojo_metrics::inc_tasks_failed(&channel);
                error!(id, %channel, function = %task.function, "task failed: {message}");
            }
        }
        Ok(())
    }

    /// Scan the pending lists of every subscribed channel and submit what is
    /// there, oldest first. Covers cold starts and publishes missed while
    /// disconnected.
    pub async fn queue_pending_tasks(&self) -> EngineResult<usize> {
        let mut queued = 0;
        for channel in &self.inner.channels {
            for id in self.inner.manager.get_pending_ids(channel).await? {
                self.queue_task(id);
                queued += 1;
            }
        }
        if queued > 0 {
            info!(queued, "queued pending backlog");
        }
        Ok(queued)
    }

    /// Return running ids this host owned in a previous life to their
    /// pending lists. Ids with no surviving record are recovered too.
    pub async fn reset_running_tasks(&self) -> EngineResult<usize> {
        let manager = &self.inner.manager;
        let mut moved = 0;
        for channel in &self.inner.channels {
            for id in manager.get_running_ids(channel).await? {
                let owner = manager.get_task(&id).await?.and_then(|task| task.runner);
                let ours = owner.map_or(true, |hostname| hostname == self.inner.opts.hostname);
                if ours && manager.return_to_pending(&id, channel).await? {
                    moved += 1;
                }
            }
        }
        if moved > 0 {
            info!(moved, "returned stale running tasks to pending");
        }
        Ok(moved)
    }

    /// Live descriptor of this runner as published into the registry.
    pub fn get_runner_status(&self) -> RunnerDescriptor {
        let now = unix_now();
        RunnerDescriptor {
            hostname: self.inner.opts.hostname.clone(),
            status: match self.state() {
                EngineState::Draining => RunnerStatus::Draining,
                _ => RunnerStatus::Active,
            },
            started_at: self.inner.started_at,
            last_ping: now,
            max_workers: self.inner.opts.max_workers,
            channels: self.inner.channels.clone(),
            uptime: now - self.inner.started_at,
            active_threads: self.inner.active.load(Ordering::SeqCst),
            ping_age: None,
        }
    }

    /// Refresh this runner's entry in the shared registry.
    pub async fn update_runner_status(&self) -> EngineResult<()> {
        self.inner
            .manager
            .register_runner(&self.get_runner_status())
            .await?;
        Ok(())
    }

    async fn heartbeat_loop(&self) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.inner.opts.heartbeat_interval));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick completes immediately; registration already happened
        interval.tick().await;
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.update_runner_status().await {
                        warn!("heartbeat: failed to refresh runner entry: {e}");
                    }
                    if let Err(e) = self.ping_runners().await {
                        warn!("heartbeat: failed to ping runners: {e}");
                    }
                    if let Err(e) = self.cleanup_stale_runners().await {
                        warn!("heartbeat: failed to purge stale runners: {e}");
                    }
                }
            }
        }
    }

    /// Send a ping to every other active runner's private topic.
    pub async fn ping_runners(&self) -> EngineResult<usize> {
        let manager = &self.inner.manager;
        let runners = manager.get_active_runners().await?;
        let mut conn = manager.store().conn();
        let mut pinged = 0;
        for (hostname, descriptor) in runners {
            if hostname == self.inner.opts.hostname || descriptor.status != RunnerStatus::Active {
                continue;
            }
            let ping = ControlMessage::Ping {
                from: self.inner.opts.hostname.clone(),
                timestamp: unix_now(),
            };
            let topic = manager.channel_topic(&format!("runner_{hostname}"));
            conn.publish(&topic, &serde_json::to_vec(&ping)?).await?;
            pinged += 1;
        }
        Ok(pinged)
    }

    /// Answer a ping with our live descriptor on the requester's topic.
    pub async fn handle_ping_request(&self, from: &str) -> EngineResult<()> {
        let response = ControlMessage::PingResponse {
            from: self.inner.opts.hostname.clone(),
            to: from.to_string(),
            timestamp: unix_now(),
            status: self.get_runner_status(),
        };
        let topic = self.inner.manager.channel_topic(&format!("runner_{from}"));
        self.inner
            .manager
            .store()
            .conn()
            .publish(&topic, &serde_json::to_vec(&response)?)
            .await?;
        debug!(to = from, "answered ping");
        Ok(())
    }

    /// Upsert the responder's descriptor with a fresh last_ping.
    pub async fn handle_ping_response(
        &self,
        from: &str,
        mut descriptor: RunnerDescriptor,
    ) -> EngineResult<()> {
        descriptor.hostname = from.to_string();
        descriptor.last_ping = unix_now();
        descriptor.ping_age = None;
        self.inner.manager.register_runner(&descriptor).await?;
        debug!(from, "refreshed runner entry from ping response");
        Ok(())
    }

    /// Drop registry entries whose heartbeat stopped long ago.
    pub async fn cleanup_stale_runners(&self) -> EngineResult<usize> {
        Ok(self
            .inner
            .manager
            .clear_runners(self.inner.opts.stale_threshold)
            .await?)
    }

    /// True once every submitted task has finished, or false when the
    /// timeout elapses first.
    pub async fn wait_for_all_tasks_to_complete(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Drain and stop: no new submissions are accepted, in-flight work gets
    /// `timeout` to finish, then the runner unregisters. Returns whether the
    /// drain completed in time; abandoned work is reclaimed later by another
    /// runner's orphan recovery.
    pub async fn shutdown(&self, timeout: Duration) -> EngineResult<bool> {
        info!(hostname = %self.inner.opts.hostname, "task engine draining");
        self.set_state(EngineState::Draining);
        if let Err(e) = self.update_runner_status().await {
            warn!("failed to publish draining status: {e}");
        }
        self.inner.shutdown.cancel();

        let drained = self.wait_for_all_tasks_to_complete(timeout).await;
        if !drained {
            warn!(
                outstanding = self.inner.in_flight.load(Ordering::SeqCst),
                "drain timeout elapsed, abandoning outstanding tasks"
            );
        }

        self.inner
            .manager
            .unregister_runner(&self.inner.opts.hostname)
            .await?;
        self.set_state(EngineState::Stopped);
        info!(hostname = %self.inner.opts.hostname, "task engine stopped");
        Ok(drained)
    }
}
