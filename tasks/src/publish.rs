use crate::{TaskManager, TaskManagerResult, DEFAULT_CHANNEL};
use serde_json::{json, Map, Value};

/// Reusable publisher for one function: holds the dotted name plus channel
/// and expiry defaults, so call sites enqueue with just the arguments.
///
/// Calling [`publish`](Self::publish) never runs the function locally; the
/// runner that picks the task up resolves the name in its own registry and
/// invokes the real implementation there.
#[derive(Clone)]
pub struct TaskPublisher {
    manager: TaskManager,
    function: String,
    channel: String,
    expires: Option<u64>,
}

impl TaskPublisher {
    pub fn new(manager: TaskManager, function: impl Into<String>) -> Self {
        Self {
            manager,
            function: function.into(),
            channel: DEFAULT_CHANNEL.to_string(),
            expires: None,
        }
    }

    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn expires(mut self, expires: u64) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    /// Enqueue a call with positional and keyed arguments. Returns the task
    /// id; completion is observable through queue state, never awaited here.
    pub async fn publish(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> TaskManagerResult<String> {
        let data = json!({ "args": args, "kwargs": kwargs });
        self.manager
            .publish(&self.function, data, Some(&self.channel), self.expires)
            .await
    }

    /// Enqueue a call with positional arguments only.
    pub async fn publish_args(&self, args: Vec<Value>) -> TaskManagerResult<String> {
        self.publish(args, Map::new()).await
    }
}
