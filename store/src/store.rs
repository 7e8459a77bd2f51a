use crate::{MemoryConn, StoreConfig, StoreConn, StoreError, StoreResult};
use backoff::ExponentialBackoff;
use futures_util::StreamExt;
use redis::Client;
use redis::aio::ConnectionManager;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Handle to the shared store. Cloning is cheap; all clones talk to the same
/// backend.
#[derive(Clone)]
pub struct Store {
    config: StoreConfig,
    backend: Backend,
}

#[derive(Clone)]
enum Backend {
    Redis {
        client: Client,
        manager: ConnectionManager,
    },
    Memory(MemoryConn),
}

impl Store {
    pub async fn open(config: StoreConfig) -> StoreResult<Self> {
        let backend = if config.enable_redis_store {
            info!("Store.open: connecting to redis: {}", config.url);
            let client = Client::open(config.url.as_str())?;
            let manager = connect(&client).await?;
            Backend::Redis { client, manager }
        } else {
            info!("Store.open: using memory store: {}", config.url);
            Backend::Memory(MemoryConn::new(config.url.clone()))
        };
        Ok(Self { config, backend })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn conn(&self) -> StoreConn {
        match &self.backend {
            Backend::Redis { manager, .. } => StoreConn::Redis(manager.clone()),
            Backend::Memory(conn) => StoreConn::Memory(conn.clone()),
        }
    }

    /// Open a subscription delivering every message published on any of the
    /// given topics. The subscription does not survive connection loss; the
    /// caller re-subscribes when [`Subscription::next_message`] reports the
    /// stream as closed.
    pub async fn subscribe(&self, topics: &[String]) -> StoreResult<Subscription> {
        match &self.backend {
            Backend::Redis { client, .. } => {
                let mut pubsub = client.get_async_pubsub().await?;
                for topic in topics {
                    pubsub.subscribe(topic).await?;
                }
                Ok(Subscription::Redis(pubsub))
            }
            Backend::Memory(conn) => Ok(Subscription::Memory {
                rx: conn.subscribe_events(),
                topics: topics.iter().cloned().collect(),
            }),
        }
    }
}

async fn connect(client: &Client) -> StoreResult<ConnectionManager> {
    let backoff = ExponentialBackoff {
        initial_interval: Duration::from_secs(10),
        max_interval: Duration::from_secs(60),
        max_elapsed_time: Some(Duration::from_secs(300)),
        ..Default::default()
    };

    backoff::future::retry(backoff, || async {
        client.get_connection_manager().await.map_err(|e| {
            error!("Store.connect: failed to connect to redis: {e:?}, retrying...");
            backoff::Error::transient(e)
        })
    })
    .await
    .map_err(StoreError::Redis)
}

/// A live pub/sub subscription yielding `(topic, payload)` pairs.
pub enum Subscription {
    Redis(redis::aio::PubSub),
    Memory {
        rx: broadcast::Receiver<(String, Vec<u8>)>,
        topics: HashSet<String>,
    },
}

impl Subscription {
    /// Next message on any subscribed topic. `Ok(None)` means the
    /// subscription is gone and must be re-established.
    pub async fn next_message(&mut self) -> StoreResult<Option<(String, Vec<u8>)>> {
        match self {
            Subscription::Redis(pubsub) => {
                let msg = {
                    let mut stream = pubsub.on_message();
                    stream.next().await
                };
                Ok(msg.map(|msg| {
                    (
                        msg.get_channel_name().to_string(),
                        msg.get_payload_bytes().to_vec(),
                    )
                }))
            }
            Subscription::Memory { rx, topics } => loop {
                match rx.recv().await {
                    Ok((topic, payload)) if topics.contains(&topic) => {
                        return Ok(Some((topic, payload)))
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        warn!("Subscription lagged, dropped {count} messages");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(None),
                }
            },
        }
    }
}
