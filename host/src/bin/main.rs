use mojo_engine::{EngineOpts, TaskEngine, TaskRegistry};
use mojo_host::{parse_opts, Cli, Command};
use mojo_store::{Store, StoreConfig};
use mojo_tasks::{TaskManager, TaskManagerOpts};
use serde_json::Value;
use std::fs::create_dir_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let opts = parse_opts();
    let _guard = subscribe_log(&opts.log_path, &opts.log_level);

    let code = match run(opts).await {
        Ok(code) => code,
        Err(e) => {
            error!("fatal: {e:#}");
            2
        }
    };
    std::process::exit(code);
}

async fn run(opts: Cli) -> anyhow::Result<i32> {
    let store = Store::open(StoreConfig {
        url: opts.redis_url.clone(),
        enable_redis_store: !opts.memory_store,
    })
    .await?;

    let prefix = opts.prefix.clone();
    let manager_for = move |channels: Vec<String>| {
        TaskManager::new(
            store.clone(),
            TaskManagerOpts {
                channels,
                prefix: prefix.clone(),
                ..Default::default()
            },
        )
    };

    match opts.command {
        Command::Run {
            channels,
            max_workers,
            drain_timeout,
        } => {
            let manager = manager_for(channels.clone());
            // Task handlers are registered by the application embedding the
            // engine; a bare host still drives recovery and control traffic.
            let registry = Arc::new(TaskRegistry::new());
            let engine = TaskEngine::new(
                manager,
                registry,
                EngineOpts {
                    channels,
                    max_workers,
                    ..Default::default()
                },
            );

            let runner = engine.clone();
            let mut handle = tokio::spawn(async move { runner.run().await });

            tokio::select! {
                result = &mut handle => {
                    match result {
                        Ok(Ok(())) => Ok(0),
                        Ok(Err(e)) => {
                            error!("engine failed: {e}");
                            Ok(2)
                        }
                        Err(e) => {
                            error!("engine crashed: {e}");
                            Ok(2)
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, draining");
                    let drained = engine.shutdown(Duration::from_secs(drain_timeout)).await?;
                    Ok(if drained { 0 } else { 1 })
                }
            }
        }

        Command::Status { simple, local } => {
            let manager = manager_for(vec![]);
            let status = manager.get_status(simple, local).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(0)
        }

        Command::ChannelStatus { channel } => {
            let manager = manager_for(vec![]);
            let status = manager.get_channel_status(&channel).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(0)
        }

        Command::Publish {
            function,
            channel,
            data,
            expires,
        } => {
            let manager = manager_for(vec![]);
            let data = match data {
                Some(raw) => serde_json::from_str(&raw)?,
                None => Value::Null,
            };
            let id = manager
                .publish(&function, data, Some(&channel), expires)
                .await?;
            println!("{id}");
            Ok(0)
        }

        Command::Cancel { task_id } => {
            let manager = manager_for(vec![]);
            if manager.cancel_task(&task_id).await? {
                println!("cancelled {task_id}");
                Ok(0)
            } else {
                println!("not cancellable: {task_id}");
                Ok(1)
            }
        }

        Command::ClearChannel { channel } => {
            let manager = manager_for(vec![]);
            manager.clear_channel(&channel).await?;
            println!("cleared {channel}");
            Ok(0)
        }

        Command::ClearRunners { ping_age } => {
            let manager = manager_for(vec![]);
            let cleared = manager.clear_runners(ping_age).await?;
            println!("cleared {cleared} runner entries");
            Ok(0)
        }
    }
}

fn subscribe_log(log_path: &Option<PathBuf>, log_level: &str) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_filter(env_filter);

    if let Some(dir) = log_path {
        if let Err(e) = create_dir_all(dir) {
            eprintln!("Failed to create log dir: {e}");
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, "mojo-host.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        let file_layer = fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_filter(EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info")));

        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry().with(stdout_layer).init();
        None
    }
}
