#[cfg(test)]
mod tests {
    use mojo_store::{memory_store_config, Store};
    use mojo_tasks::{
        unix_now, RunnerDescriptor, RunnerStatus, TaskManager, TaskManagerOpts, TaskPublisher,
        TaskStatus,
    };
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use serde_json::{json, Map, Value};

    async fn test_manager(id: &str) -> TaskManager {
        let store = Store::open(memory_store_config(id)).await.unwrap();
        TaskManager::new(store, TaskManagerOpts::with_channels(&["test"]))
    }

    fn random_payload(rng: &mut StdRng) -> Value {
        json!({
            "args": [rng.gen::<u32>(), format!("arg-{}", rng.gen::<u16>()), null, true],
            "kwargs": {
                "depth": rng.gen_range(0..1000),
                "ratio": 0.25,
                "nested": { "flags": [false, null], "label": "x" },
            },
            "blob": (0..4).map(|_| rng.gen::<u8>()).collect::<Vec<_>>(),
        })
    }

    #[tokio::test]
    async fn test_publish_creates_pending_record() {
        let manager = test_manager("test_publish_creates_pending_record").await;

        let id = manager
            .publish("jobs.reindex", json!({"x": 1}), Some("test"), None)
            .await
            .unwrap();

        let task = manager.get_task(&id).await.unwrap().expect("task record");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.channel, "test");
        assert_eq!(task.function, "jobs.reindex");
        assert_eq!(task.data, json!({"x": 1}));
        assert!(task.expires.unwrap() > task.created_at);

        assert_eq!(manager.get_pending_ids("test").await.unwrap(), vec![id]);
        assert_eq!(manager.get_channels().await.unwrap(), vec!["test"]);
    }

    #[tokio::test]
    async fn test_payload_round_trip() {
        let manager = test_manager("test_payload_round_trip").await;
        let mut rng = StdRng::seed_from_u64(123);

        for _ in 0..5 {
            let payload = random_payload(&mut rng);
            let id = manager
                .publish("jobs.echo", payload.clone(), Some("test"), None)
                .await
                .unwrap();
            let task = manager.get_task(&id).await.unwrap().unwrap();
            assert_eq!(task.data, payload);
        }
    }

    #[tokio::test]
    async fn test_lifecycle_queue_membership() {
        let manager = test_manager("test_lifecycle_queue_membership").await;

        let id = manager
            .publish("jobs.reindex", Value::Null, Some("test"), None)
            .await
            .unwrap();

        // pending only
        assert!(manager.get_pending_ids("test").await.unwrap().contains(&id));
        assert!(manager.get_running_ids("test").await.unwrap().is_empty());

        // pending -> running
        manager.remove_from_pending(&id, "test").await.unwrap();
        manager.add_to_running(&id, "test").await.unwrap();
        assert!(manager.get_pending_ids("test").await.unwrap().is_empty());
        assert_eq!(manager.get_running_ids("test").await.unwrap(), vec![id.clone()]);

        // running -> completed
        let mut task = manager.get_task(&id).await.unwrap().unwrap();
        manager.remove_from_running(&id, "test").await.unwrap();
        manager.add_to_completed(&mut task).await.unwrap();
        assert!(manager.get_running_ids("test").await.unwrap().is_empty());
        assert_eq!(
            manager.get_completed_ids("test").await.unwrap(),
            vec![id.clone()]
        );

        let stored = manager.get_task(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.completed_at.unwrap() >= stored.created_at);
    }

    #[tokio::test]
    async fn test_error_transition_records_message() {
        let manager = test_manager("test_error_transition_records_message").await;

        let id = manager
            .publish("jobs.flaky", Value::Null, Some("test"), None)
            .await
            .unwrap();
        let mut task = manager.get_task(&id).await.unwrap().unwrap();

        manager.remove_from_pending(&id, "test").await.unwrap();
        manager
            .add_to_errors(&mut task, "boom: out of cheese")
            .await
            .unwrap();

        assert_eq!(manager.get_error_ids("test").await.unwrap(), vec![id.clone()]);
        let stored = manager.get_task(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Error);
        assert_eq!(stored.error.as_deref(), Some("boom: out of cheese"));
    }

    #[tokio::test]
    async fn test_cancel_task() {
        let manager = test_manager("test_cancel_task").await;

        // pending task cancels
        let id = manager
            .publish("jobs.reindex", Value::Null, Some("test"), None)
            .await
            .unwrap();
        assert!(manager.cancel_task(&id).await.unwrap());
        assert_eq!(
            manager.get_task(&id).await.unwrap().unwrap().status,
            TaskStatus::Cancelled
        );
        assert!(manager.get_pending_ids("test").await.unwrap().is_empty());

        // cancelling again is a no-op
        assert!(!manager.cancel_task(&id).await.unwrap());

        // running task does not cancel
        let running = manager
            .publish("jobs.reindex", Value::Null, Some("test"), None)
            .await
            .unwrap();
        manager.remove_from_pending(&running, "test").await.unwrap();
        manager.add_to_running(&running, "test").await.unwrap();
        let mut task = manager.get_task(&running).await.unwrap().unwrap();
        task.status = TaskStatus::Running;
        manager.save_task(&task, None).await.unwrap();
        assert!(!manager.cancel_task(&running).await.unwrap());

        // missing task returns false
        assert!(!manager.cancel_task("no-such-id").await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_loses_race_against_claiming_runner() {
        let manager = test_manager("test_cancel_loses_race_against_claim").await;

        let id = manager
            .publish("jobs.reindex", Value::Null, Some("test"), None)
            .await
            .unwrap();

        // a runner claims the task before it has persisted any record
        // update, so the record still reads pending
        assert!(manager.claim_pending(&id, "test").await.unwrap());

        // the cancel must lose the race and leave the record alone
        assert!(!manager.cancel_task(&id).await.unwrap());
        assert_eq!(
            manager.get_task(&id).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
        assert_eq!(manager.get_running_ids("test").await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_claim_pending_single_winner() {
        let manager = test_manager("test_claim_pending_single_winner").await;

        let id = manager
            .publish("jobs.reindex", Value::Null, Some("test"), None)
            .await
            .unwrap();

        assert!(manager.claim_pending(&id, "test").await.unwrap());
        // a second claimant loses and must not duplicate the id
        assert!(!manager.claim_pending(&id, "test").await.unwrap());

        assert!(manager.get_pending_ids("test").await.unwrap().is_empty());
        assert_eq!(
            manager.get_running_ids("test").await.unwrap(),
            vec![id.clone()]
        );
    }

    #[tokio::test]
    async fn test_remove_task_purges_everywhere() {
        let manager = test_manager("test_remove_task_purges_everywhere").await;

        let id = manager
            .publish("jobs.reindex", Value::Null, Some("test"), None)
            .await
            .unwrap();
        assert!(manager.remove_task(&id).await.unwrap());

        assert!(manager.get_task(&id).await.unwrap().is_none());
        assert!(manager.get_pending_ids("test").await.unwrap().is_empty());
        assert!(manager.get_running_ids("test").await.unwrap().is_empty());
        assert!(manager.get_completed_ids("test").await.unwrap().is_empty());
        assert!(manager.get_error_ids("test").await.unwrap().is_empty());

        // idempotent
        assert!(!manager.remove_task(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_key_expiration_is_set() {
        let manager = test_manager("test_key_expiration_is_set").await;

        let id = manager
            .publish("jobs.reindex", Value::Null, Some("test"), Some(600))
            .await
            .unwrap();
        let ttl = manager.get_key_expiration(&id).await.unwrap().unwrap();
        assert!(ttl <= 600 && ttl > 590, "unexpected ttl {ttl}");

        assert_eq!(
            manager.get_key_expiration("no-such-id").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_status_totals_match_channel_sums() {
        let manager = test_manager("test_status_totals_match_channel_sums").await;

        for channel in ["ch1", "ch2", "ch3"] {
            for _ in 0..2 {
                manager
                    .publish("jobs.reindex", Value::Null, Some(channel), None)
                    .await
                    .unwrap();
            }
        }
        // move one ch1 task to completed
        let id = manager.get_pending_ids("ch1").await.unwrap()[0].clone();
        let mut task = manager.get_task(&id).await.unwrap().unwrap();
        manager.remove_from_pending(&id, "ch1").await.unwrap();
        manager.add_to_completed(&mut task).await.unwrap();

        let status = manager.get_status(false, false).await.unwrap();
        let channels = status.channels.as_ref().unwrap();
        let pending_sum: usize = channels.values().map(|c| c.pending).sum();
        let completed_sum: usize = channels.values().map(|c| c.completed).sum();
        assert_eq!(status.pending, pending_sum);
        assert_eq!(status.completed, completed_sum);
        assert_eq!(status.pending, 5);
        assert_eq!(status.completed, 1);

        let simple = manager.get_status(true, false).await.unwrap();
        assert!(simple.channels.is_none());
        assert_eq!(simple.pending, status.pending);
    }

    #[tokio::test]
    async fn test_take_out_the_dead_preserves_order() {
        let manager = test_manager("test_take_out_the_dead_preserves_order").await;
        let now = unix_now();

        // a live runner whose tasks must be left alone
        manager
            .register_runner(&RunnerDescriptor {
                hostname: "alive-host".into(),
                status: RunnerStatus::Active,
                started_at: now,
                last_ping: now,
                max_workers: 5,
                channels: vec!["test".into()],
                uptime: 0,
                active_threads: 0,
                ping_age: None,
            })
            .await
            .unwrap();

        let mut orphaned = vec![];
        for n in 0..3 {
            let id = manager
                .publish("jobs.reindex", Value::Null, Some("test"), None)
                .await
                .unwrap();
            manager.remove_from_pending(&id, "test").await.unwrap();
            manager.add_to_running(&id, "test").await.unwrap();
            let mut task = manager.get_task(&id).await.unwrap().unwrap();
            task.runner = Some(if n == 1 { "alive-host" } else { "dead-host" }.to_string());
            manager.save_task(&task, None).await.unwrap();
            orphaned.push(id);
        }

        let recovered = manager.take_out_the_dead().await.unwrap();
        assert_eq!(recovered, 2);

        // dead-host's tasks are back in pending, in their original order
        assert_eq!(
            manager.get_pending_ids("test").await.unwrap(),
            vec![orphaned[0].clone(), orphaned[2].clone()]
        );
        // alive-host keeps its running task
        assert_eq!(
            manager.get_running_ids("test").await.unwrap(),
            vec![orphaned[1].clone()]
        );
    }

    #[tokio::test]
    async fn test_active_runners_relabel_timeout() {
        let manager = test_manager("test_active_runners_relabel_timeout").await;
        let now = unix_now();

        for (hostname, last_ping) in [("fresh-host", now), ("stale-host", now - 200)] {
            manager
                .register_runner(&RunnerDescriptor {
                    hostname: hostname.into(),
                    status: RunnerStatus::Active,
                    started_at: now - 300,
                    last_ping,
                    max_workers: 5,
                    channels: vec!["test".into()],
                    uptime: 300,
                    active_threads: 0,
                    ping_age: None,
                })
                .await
                .unwrap();
        }

        let runners = manager.get_active_runners().await.unwrap();
        assert_eq!(runners["fresh-host"].status, RunnerStatus::Active);
        assert_eq!(runners["stale-host"].status, RunnerStatus::Timeout);
        assert!(runners["stale-host"].ping_age.unwrap() >= 200);

        // stale entries can be purged
        let cleared = manager.clear_runners(120).await.unwrap();
        assert_eq!(cleared, 1);
        let runners = manager.get_active_runners().await.unwrap();
        assert!(runners.contains_key("fresh-host"));
        assert!(!runners.contains_key("stale-host"));

        manager.unregister_runner("fresh-host").await.unwrap();
        assert!(manager.get_active_runners().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_channel_keeps_records() {
        let manager = test_manager("test_clear_channel_keeps_records").await;

        let id = manager
            .publish("jobs.reindex", Value::Null, Some("test"), None)
            .await
            .unwrap();
        manager.clear_channel("test").await.unwrap();

        assert!(manager.get_pending_ids("test").await.unwrap().is_empty());
        // the record survives and ages out by TTL instead
        assert!(manager.get_task(&id).await.unwrap().is_some());
        // the channel stays registered until removed explicitly
        assert_eq!(manager.get_channels().await.unwrap(), vec!["test"]);

        manager.remove_channel("test").await.unwrap();
        assert!(manager.get_channels().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_channel_registry_is_superset() {
        let manager = test_manager("test_channel_registry_is_superset").await;

        for channel in ["alpha", "beta", "gamma"] {
            manager
                .publish("jobs.reindex", Value::Null, Some(channel), None)
                .await
                .unwrap();
        }
        assert_eq!(
            manager.get_channels().await.unwrap(),
            vec!["alpha", "beta", "gamma"]
        );

        manager.remove_all_channels().await.unwrap();
        assert!(manager.get_channels().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_include_data_strips_payload() {
        let manager = test_manager("test_include_data_strips_payload").await;

        manager
            .publish("jobs.reindex", json!({"huge": "payload"}), Some("test"), None)
            .await
            .unwrap();

        let with_data = manager.get_pending("test", true).await.unwrap();
        assert_eq!(with_data[0].data, json!({"huge": "payload"}));

        let without_data = manager.get_pending("test", false).await.unwrap();
        assert_eq!(without_data[0].data, Value::Null);
        assert_eq!(without_data[0].function, "jobs.reindex");
    }

    #[tokio::test]
    async fn test_get_all_unions_channels() {
        let manager = test_manager("test_get_all_unions_channels").await;

        let a = manager
            .publish("jobs.reindex", Value::Null, Some("ch1"), None)
            .await
            .unwrap();
        let b = manager
            .publish("jobs.reindex", Value::Null, Some("ch2"), None)
            .await
            .unwrap();

        let all = manager.get_all_pending(false, true).await.unwrap();
        let mut ids: Vec<String> = all.into_iter().map(|task| task.id).collect();
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);

        // the local view only covers this manager's configured channels
        let local = manager.get_all_pending(true, true).await.unwrap();
        assert!(local.is_empty());
    }

    #[tokio::test]
    async fn test_publisher_wraps_arguments() {
        let manager = test_manager("test_publisher_wraps_arguments").await;

        let publisher = TaskPublisher::new(manager.clone(), "jobs.notify")
            .channel("test")
            .expires(900);

        let mut kwargs = Map::new();
        kwargs.insert("retries".into(), json!(3));
        let id = publisher
            .publish(vec![json!("first"), json!(2)], kwargs)
            .await
            .unwrap();

        let task = manager.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.function, "jobs.notify");
        assert_eq!(task.channel, "test");
        assert_eq!(task.args(), vec![json!("first"), json!(2)]);
        assert_eq!(task.kwargs().get("retries"), Some(&json!(3)));
        let ttl = manager.get_key_expiration(&id).await.unwrap().unwrap();
        assert!(ttl <= 900 && ttl > 890);
    }
}
