use crate::{
    unix_now, ChannelStatus, QueueStatus, RunnerDescriptor, RunnerStatus, Task, TaskStatus,
};
use mojo_store::{Store, StoreError};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_PREFIX: &str = "mojo:tasks";
pub const DEFAULT_CHANNEL: &str = "default";
/// Default task record lifetime in seconds.
pub const DEFAULT_EXPIRES: u64 = 1800;
/// A runner whose last ping is older than this is dead.
pub const DEFAULT_LIVENESS_THRESHOLD: u64 = 60;

pub type TaskManagerResult<T> = Result<T, TaskManagerError>;

#[derive(Error, Debug)]
pub enum TaskManagerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct TaskManagerOpts {
    /// Channels this process cares about. Informational: every operation
    /// takes an explicit channel, these only seed the `local` views.
    pub channels: Vec<String>,
    pub prefix: String,
    pub liveness_threshold: u64,
    pub default_expires: u64,
}

impl Default for TaskManagerOpts {
    fn default() -> Self {
        Self {
            channels: vec![DEFAULT_CHANNEL.to_string()],
            prefix: DEFAULT_PREFIX.to_string(),
            liveness_threshold: DEFAULT_LIVENESS_THRESHOLD,
            default_expires: DEFAULT_EXPIRES,
        }
    }
}

impl TaskManagerOpts {
    pub fn with_channels<S: ToString>(channels: &[S]) -> Self {
        Self {
            channels: channels.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }
}

/// All persistence and queue-membership operations of the task queue. Pure
/// data plane: nothing here executes a task.
///
/// Every instance derives the same keys from the same prefix, so any number
/// of processes can operate on the queue concurrently; the store's atomic
/// list primitives arbitrate between them.
#[derive(Clone)]
pub struct TaskManager {
    store: Store,
    opts: TaskManagerOpts,
}

impl TaskManager {
    pub fn new(store: Store, opts: TaskManagerOpts) -> Self {
        Self { store, opts }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn local_channels(&self) -> &[String] {
        &self.opts.channels
    }

    pub fn liveness_threshold(&self) -> u64 {
        self.opts.liveness_threshold
    }

    // Key derivation. Purely syntactic and stable across processes.

    pub fn task_key(&self, id: &str) -> String {
        format!("{}:t:{}", self.opts.prefix, id)
    }

    pub fn pending_key(&self, channel: &str) -> String {
        format!("{}:p:{}", self.opts.prefix, channel)
    }

    pub fn running_key(&self, channel: &str) -> String {
        format!("{}:r:{}", self.opts.prefix, channel)
    }

    pub fn completed_key(&self, channel: &str) -> String {
        format!("{}:d:{}", self.opts.prefix, channel)
    }

    pub fn errors_key(&self, channel: &str) -> String {
        format!("{}:e:{}", self.opts.prefix, channel)
    }

    pub fn channel_topic(&self, channel: &str) -> String {
        format!("{}:c:{}", self.opts.prefix, channel)
    }

    pub fn channels_key(&self) -> String {
        format!("{}:channels", self.opts.prefix)
    }

    pub fn runners_key(&self) -> String {
        format!("{}:runners", self.opts.prefix)
    }

    /// Aggregate of all channel pending lists, kept for cheap global scans.
    pub fn pending_agg_key(&self) -> String {
        format!("{}:pending", self.opts.prefix)
    }

    // Publishing

    /// Create a pending task record, append it to the channel's pending
    /// list, register the channel, and announce the id on the channel topic.
    /// Returns the task id.
    pub async fn publish(
        &self,
        function: &str,
        data: Value,
        channel: Option<&str>,
        expires: Option<u64>,
    ) -> TaskManagerResult<String> {
        let channel = channel.unwrap_or(DEFAULT_CHANNEL);
        let expires = expires.unwrap_or(self.opts.default_expires);

        let mut task = Task::new(function, data, channel);
        task.expires = Some(task.created_at + expires as i64);

        self.save_task(&task, Some(expires)).await?;
        self.add_to_pending(&task.id, channel).await?;
        self.add_channel(channel).await?;
        self.store
            .conn()
            .publish(&self.channel_topic(channel), task.id.as_bytes())
            .await?;

        info!(id = %task.id, function, channel, "published task");
        Ok(task.id)
    }

    // Task records

    /// Upsert the record. The key TTL is `expires` when given, otherwise
    /// whatever lifetime the record itself has left, otherwise the default.
    pub async fn save_task(&self, task: &Task, expires: Option<u64>) -> TaskManagerResult<()> {
        let ttl = expires
            .or_else(|| {
                task.expires
                    .map(|at| at.saturating_sub(unix_now()).max(1) as u64)
            })
            .unwrap_or(self.opts.default_expires);
        let serialized = serde_json::to_string(task)?;
        self.store
            .conn()
            .set_ex(&self.task_key(&task.id), &serialized, ttl)
            .await?;
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> TaskManagerResult<Option<Task>> {
        let Some(raw) = self.store.conn().get(&self.task_key(id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                warn!(id, "dropping undecodable task record: {e}");
                Ok(None)
            }
        }
    }

    /// Remaining lifetime of the record key in seconds, absent when the key
    /// is gone.
    pub async fn get_key_expiration(&self, id: &str) -> TaskManagerResult<Option<u64>> {
        Ok(self.store.conn().ttl(&self.task_key(id)).await?)
    }

    /// Delete the record and purge the id from every list it could be in.
    /// Idempotent; returns whether the record still existed.
    pub async fn remove_task(&self, id: &str) -> TaskManagerResult<bool> {
        let mut conn = self.store.conn();
        let existed = conn.del(&self.task_key(id)).await?;
        for channel in self.all_channels().await? {
            conn.lrem(&self.pending_key(&channel), id).await?;
            conn.lrem(&self.running_key(&channel), id).await?;
            conn.lrem(&self.completed_key(&channel), id).await?;
            conn.lrem(&self.errors_key(&channel), id).await?;
        }
        conn.srem(&self.pending_agg_key(), id).await?;
        Ok(existed)
    }

    // Queue membership

    pub async fn add_to_pending(&self, id: &str, channel: &str) -> TaskManagerResult<()> {
        let mut conn = self.store.conn();
        conn.rpush(&self.pending_key(channel), id).await?;
        conn.sadd(&self.pending_agg_key(), id).await?;
        Ok(())
    }

    pub async fn remove_from_pending(&self, id: &str, channel: &str) -> TaskManagerResult<usize> {
        let mut conn = self.store.conn();
        let removed = conn.lrem(&self.pending_key(channel), id).await?;
        conn.srem(&self.pending_agg_key(), id).await?;
        Ok(removed)
    }

    pub async fn add_to_running(&self, id: &str, channel: &str) -> TaskManagerResult<()> {
        self.store
            .conn()
            .rpush(&self.running_key(channel), id)
            .await?;
        Ok(())
    }

    pub async fn remove_from_running(&self, id: &str, channel: &str) -> TaskManagerResult<usize> {
        Ok(self
            .store
            .conn()
            .lrem(&self.running_key(channel), id)
            .await?)
    }

    /// Mark the task completed and append it to the completed queue. One of
    /// the two transitions allowed to mutate the record.
    pub async fn add_to_completed(&self, task: &mut Task) -> TaskManagerResult<()> {
        task.status = TaskStatus::Completed;
        task.completed_at = Some(unix_now());
        self.save_task(task, None).await?;
        self.store
            .conn()
            .rpush(&self.completed_key(&task.channel), &task.id)
            .await?;
        Ok(())
    }

    pub async fn remove_from_completed(&self, id: &str, channel: &str) -> TaskManagerResult<usize> {
        Ok(self
            .store
            .conn()
            .lrem(&self.completed_key(channel), id)
            .await?)
    }

    /// Mark the task failed and append it to the error queue. The other
    /// record-mutating transition.
    pub async fn add_to_errors(&self, task: &mut Task, error: &str) -> TaskManagerResult<()> {
        task.status = TaskStatus::Error;
        task.completed_at = Some(unix_now());
        task.error = Some(error.to_string());
        self.save_task(task, None).await?;
        self.store
            .conn()
            .rpush(&self.errors_key(&task.channel), &task.id)
            .await?;
        Ok(())
    }

    pub async fn remove_from_errors(&self, id: &str, channel: &str) -> TaskManagerResult<usize> {
        Ok(self
            .store
            .conn()
            .lrem(&self.errors_key(channel), id)
            .await?)
    }

    /// Atomically move a pending id to the running list. The store-level
    /// move arbitrates racing claimants: at most one caller observes true.
    pub async fn claim_pending(&self, id: &str, channel: &str) -> TaskManagerResult<bool> {
        let mut conn = self.store.conn();
        let moved = conn
            .move_list_entry(&self.pending_key(channel), &self.running_key(channel), id)
            .await?
            > 0;
        if moved {
            conn.srem(&self.pending_agg_key(), id).await?;
        }
        Ok(moved)
    }

    /// Move a running id back to the tail of its pending list. Returns false
    /// when another mover already took it.
    pub async fn return_to_pending(&self, id: &str, channel: &str) -> TaskManagerResult<bool> {
        let mut conn = self.store.conn();
        let moved = conn
            .move_list_entry(&self.running_key(channel), &self.pending_key(channel), id)
            .await?
            > 0;
        if moved {
            conn.sadd(&self.pending_agg_key(), id).await?;
        }
        Ok(moved)
    }

    /// Cancel a pending task. Best-effort: returns false for running or
    /// terminal tasks, and a runner racing this call may still execute the
    /// task it already pulled.
    pub async fn cancel_task(&self, id: &str) -> TaskManagerResult<bool> {
        let Some(mut task) = self.get_task(id).await? else {
            return Ok(false);
        };
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }
        // the atomic removal arbitrates against a claiming runner; a loss
        // means the task is running or settled and its record is not ours
        // to overwrite
        if self.remove_from_pending(id, &task.channel).await? == 0 {
            return Ok(false);
        }
        task.status = TaskStatus::Cancelled;
        self.save_task(&task, None).await?;
        info!(id, channel = %task.channel, "cancelled pending task");
        Ok(true)
    }

    // Queue views. Lists are appended at the tail, so every id listing is in
    // stable publication order, oldest first.

    pub async fn get_pending_ids(&self, channel: &str) -> TaskManagerResult<Vec<String>> {
        Ok(self.store.conn().lrange(&self.pending_key(channel)).await?)
    }

    pub async fn get_running_ids(&self, channel: &str) -> TaskManagerResult<Vec<String>> {
        Ok(self.store.conn().lrange(&self.running_key(channel)).await?)
    }

    pub async fn get_completed_ids(&self, channel: &str) -> TaskManagerResult<Vec<String>> {
        Ok(self
            .store
            .conn()
            .lrange(&self.completed_key(channel))
            .await?)
    }

    pub async fn get_error_ids(&self, channel: &str) -> TaskManagerResult<Vec<String>> {
        Ok(self.store.conn().lrange(&self.errors_key(channel)).await?)
    }

    pub async fn get_pending(
        &self,
        channel: &str,
        include_data: bool,
    ) -> TaskManagerResult<Vec<Task>> {
        let ids = self.get_pending_ids(channel).await?;
        self.resolve_ids(ids, include_data).await
    }

    pub async fn get_running(
        &self,
        channel: &str,
        include_data: bool,
    ) -> TaskManagerResult<Vec<Task>> {
        let ids = self.get_running_ids(channel).await?;
        self.resolve_ids(ids, include_data).await
    }

    pub async fn get_completed(
        &self,
        channel: &str,
        include_data: bool,
    ) -> TaskManagerResult<Vec<Task>> {
        let ids = self.get_completed_ids(channel).await?;
        self.resolve_ids(ids, include_data).await
    }

    pub async fn get_errors(
        &self,
        channel: &str,
        include_data: bool,
    ) -> TaskManagerResult<Vec<Task>> {
        let ids = self.get_error_ids(channel).await?;
        self.resolve_ids(ids, include_data).await
    }

    pub async fn get_all_pending(
        &self,
        local: bool,
        include_data: bool,
    ) -> TaskManagerResult<Vec<Task>> {
        let mut tasks = vec![];
        for channel in self.scan_channels(local).await? {
            tasks.extend(self.get_pending(&channel, include_data).await?);
        }
        Ok(tasks)
    }

    pub async fn get_all_running(
        &self,
        local: bool,
        include_data: bool,
    ) -> TaskManagerResult<Vec<Task>> {
        let mut tasks = vec![];
        for channel in self.scan_channels(local).await? {
            tasks.extend(self.get_running(&channel, include_data).await?);
        }
        Ok(tasks)
    }

    pub async fn get_all_completed(
        &self,
        local: bool,
        include_data: bool,
    ) -> TaskManagerResult<Vec<Task>> {
        let mut tasks = vec![];
        for channel in self.scan_channels(local).await? {
            tasks.extend(self.get_completed(&channel, include_data).await?);
        }
        Ok(tasks)
    }

    pub async fn get_all_errors(
        &self,
        local: bool,
        include_data: bool,
    ) -> TaskManagerResult<Vec<Task>> {
        let mut tasks = vec![];
        for channel in self.scan_channels(local).await? {
            tasks.extend(self.get_errors(&channel, include_data).await?);
        }
        Ok(tasks)
    }

    async fn resolve_ids(
        &self,
        ids: Vec<String>,
        include_data: bool,
    ) -> TaskManagerResult<Vec<Task>> {
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(mut task) = self.get_task(&id).await? {
                if !include_data {
                    task.data = Value::Null;
                }
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    // Status aggregation

    pub async fn get_channel_status(&self, channel: &str) -> TaskManagerResult<ChannelStatus> {
        let mut conn = self.store.conn();
        Ok(ChannelStatus {
            pending: conn.llen(&self.pending_key(channel)).await?,
            running: conn.llen(&self.running_key(channel)).await?,
            completed: conn.llen(&self.completed_key(channel)).await?,
            errors: conn.llen(&self.errors_key(channel)).await?,
        })
    }

    /// Fleet aggregate. `simple` omits the per-channel breakdown, `local`
    /// restricts the scan to this manager's own channels.
    pub async fn get_status(&self, simple: bool, local: bool) -> TaskManagerResult<QueueStatus> {
        let mut status = QueueStatus::default();
        let mut per_channel = BTreeMap::new();
        for channel in self.scan_channels(local).await? {
            let channel_status = self.get_channel_status(&channel).await?;
            status.accumulate(&channel_status);
            per_channel.insert(channel, channel_status);
        }
        status.runners = self
            .get_active_runners()
            .await?
            .values()
            .filter(|desc| desc.status != RunnerStatus::Timeout)
            .count();
        if !simple {
            status.channels = Some(per_channel);
        }
        Ok(status)
    }

    // Channel registry

    pub async fn add_channel(&self, channel: &str) -> TaskManagerResult<()> {
        self.store
            .conn()
            .sadd(&self.channels_key(), channel)
            .await?;
        Ok(())
    }

    pub async fn get_channels(&self) -> TaskManagerResult<Vec<String>> {
        let mut channels = self.store.conn().smembers(&self.channels_key()).await?;
        channels.sort();
        Ok(channels)
    }

    /// Drop all four queue lists of a channel. Task records are left to
    /// expire on their own.
    pub async fn clear_channel(&self, channel: &str) -> TaskManagerResult<()> {
        let mut conn = self.store.conn();
        for id in conn.lrange(&self.pending_key(channel)).await? {
            conn.srem(&self.pending_agg_key(), &id).await?;
        }
        conn.del(&self.pending_key(channel)).await?;
        conn.del(&self.running_key(channel)).await?;
        conn.del(&self.completed_key(channel)).await?;
        conn.del(&self.errors_key(channel)).await?;
        debug!(channel, "cleared channel queues");
        Ok(())
    }

    pub async fn remove_channel(&self, channel: &str) -> TaskManagerResult<()> {
        self.clear_channel(channel).await?;
        self.store
            .conn()
            .srem(&self.channels_key(), channel)
            .await?;
        Ok(())
    }

    pub async fn remove_all_channels(&self) -> TaskManagerResult<()> {
        for channel in self.all_channels().await? {
            self.remove_channel(&channel).await?;
        }
        Ok(())
    }

    /// Union of the registered channel set and the local channel list.
    async fn all_channels(&self) -> TaskManagerResult<Vec<String>> {
        let mut channels = self.get_channels().await?;
        let known: HashSet<String> = channels.iter().cloned().collect();
        for channel in &self.opts.channels {
            if !known.contains(channel) {
                channels.push(channel.clone());
            }
        }
        Ok(channels)
    }

    async fn scan_channels(&self, local: bool) -> TaskManagerResult<Vec<String>> {
        if local {
            Ok(self.opts.channels.clone())
        } else {
            self.all_channels().await
        }
    }

    // Runner registry

    pub async fn register_runner(&self, descriptor: &RunnerDescriptor) -> TaskManagerResult<()> {
        let serialized = serde_json::to_string(descriptor)?;
        self.store
            .conn()
            .hset(&self.runners_key(), &descriptor.hostname, &serialized)
            .await?;
        Ok(())
    }

    pub async fn unregister_runner(&self, hostname: &str) -> TaskManagerResult<()> {
        self.store
            .conn()
            .hdel(&self.runners_key(), hostname)
            .await?;
        Ok(())
    }

    pub async fn get_runner(&self, hostname: &str) -> TaskManagerResult<Option<RunnerDescriptor>> {
        let Some(raw) = self.store.conn().hget(&self.runners_key(), hostname).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_str(&raw).ok())
    }

    /// Every registered runner, with `ping_age` computed and the status
    /// relabelled to `timeout` when the heartbeat went stale.
    pub async fn get_active_runners(
        &self,
    ) -> TaskManagerResult<HashMap<String, RunnerDescriptor>> {
        let now = unix_now();
        let raw = self.store.conn().hgetall(&self.runners_key()).await?;
        let mut runners = HashMap::with_capacity(raw.len());
        for (hostname, serialized) in raw {
            let mut descriptor: RunnerDescriptor = match serde_json::from_str(&serialized) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    warn!(%hostname, "skipping undecodable runner descriptor: {e}");
                    continue;
                }
            };
            let ping_age = now.saturating_sub(descriptor.last_ping).max(0) as u64;
            descriptor.ping_age = Some(ping_age);
            if ping_age > self.opts.liveness_threshold {
                descriptor.status = RunnerStatus::Timeout;
            }
            runners.insert(hostname, descriptor);
        }
        Ok(runners)
    }

    /// Purge runner entries whose last ping is older than `ping_age`
    /// seconds. Undecodable entries are purged as well.
    pub async fn clear_runners(&self, ping_age: u64) -> TaskManagerResult<usize> {
        let now = unix_now();
        let mut conn = self.store.conn();
        let raw = conn.hgetall(&self.runners_key()).await?;
        let mut cleared = 0;
        for (hostname, serialized) in raw {
            let last_ping = serde_json::from_str::<RunnerDescriptor>(&serialized)
                .map(|descriptor| descriptor.last_ping)
                .unwrap_or(0);
            if now.saturating_sub(last_ping).max(0) as u64 > ping_age {
                conn.hdel(&self.runners_key(), &hostname).await?;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    /// Move every running id owned by a dead runner back to its channel's
    /// pending list, preserving order. An id without a surviving record
    /// cannot prove a live owner and is recovered too.
    pub async fn take_out_the_dead(&self) -> TaskManagerResult<usize> {
        let runners = self.get_active_runners().await?;
        let alive: HashSet<&String> = runners
            .iter()
            .filter(|(_, desc)| desc.status != RunnerStatus::Timeout)
            .map(|(hostname, _)| hostname)
            .collect();

        let mut recovered = 0;
        for channel in self.all_channels().await? {
            for id in self.get_running_ids(&channel).await? {
                let owner = self.get_task(&id).await?.and_then(|task| task.runner);
                let dead = match owner {
                    Some(ref hostname) => !alive.contains(hostname),
                    None => true,
                };
                if dead && self.return_to_pending(&id, &channel).await? {
                    warn!(%id, %channel, "recovered orphaned task to pending");
                    recovered += 1;
                }
            }
        }
        Ok(recovered)
    }
}
