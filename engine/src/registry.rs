use mojo_tasks::Task;
use serde_json::{Map, Value};
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, RwLock},
};

pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type TaskHandler = Arc<dyn Fn(TaskInvocation) -> TaskFuture + Send + Sync>;

/// The arguments a task carries into its handler, split out of the
/// conventional `{"args": [...], "kwargs": {...}}` payload shape.
#[derive(Debug, Clone, Default)]
pub struct TaskInvocation {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl From<&Task> for TaskInvocation {
    fn from(task: &Task) -> Self {
        Self {
            args: task.args(),
            kwargs: task.kwargs(),
        }
    }
}

/// Dotted-name lookup table mapping a task's `function` field to the real
/// implementation in this process.
///
/// Publishers and runners are decoupled: a publisher only names a function,
/// and every runner that should execute it registers the name at startup.
/// Names unknown to a runner fail the task with a resolution error.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: RwLock<HashMap<String, TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(TaskInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |invocation| Box::pin(handler(invocation)));
        self.handlers
            .write()
            .unwrap()
            .insert(name.into(), handler);
    }

    pub fn resolve(&self, name: &str) -> Option<TaskHandler> {
        self.handlers.read().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve and invoke synchronously in this process, bypassing the
    /// queue. This is the entry point the runner itself uses once it owns a
    /// task.
    pub async fn invoke_direct(&self, task: &Task) -> anyhow::Result<()> {
        let handler = self
            .resolve(&task.function)
            .ok_or_else(|| anyhow::anyhow!("unresolvable function: {}", task.function))?;
        handler(TaskInvocation::from(task)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_register_and_invoke() {
        let registry = TaskRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        registry.register("tests.count", move |invocation| {
            let counter = counter.clone();
            async move {
                assert_eq!(invocation.args, vec![json!(7)]);
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        });

        let task = Task::new("tests.count", json!({"args": [7]}), "default");
        registry.invoke_direct(&task).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.names(), vec!["tests.count"]);
    }

    #[tokio::test]
    async fn test_unknown_name_fails() {
        let registry = TaskRegistry::new();
        let task = Task::new("tests.missing", serde_json::Value::Null, "default");
        let err = registry.invoke_direct(&task).await.unwrap_err();
        assert!(err.to_string().contains("tests.missing"));
    }
}
