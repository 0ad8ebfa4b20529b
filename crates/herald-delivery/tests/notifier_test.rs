//! Integration tests for the notifier pipeline.
//!
//! Drives real notifiers against a mock chat webhook with virtual time, so
//! retry and cool-down behaviour runs without real waiting.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::time::Duration;

use herald_core::{
    DeliveryStatus, EventType, NotificationEvent, SettingsStore, SlackSettings, SuppressReason,
};
use herald_delivery::{
    event_channel, CircuitConfig, CircuitState, DeliveryError, EventDisposition, Notifier,
    OverflowPolicy, QueueConfig,
};
use herald_testing::{push_muted_settings, repository, EventBuilder, TestEnv};

/// Polls until the notifier has taken every queued message off its queues.
async fn wait_until_dequeued(notifier: &Notifier) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while notifier.stats().queued > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queue drained in time");
}

#[tokio::test]
async fn disabling_settings_stops_the_next_push() {
    let env = TestEnv::new().await;
    let repo = repository("abc");
    env.webhook.respond_with("abc", 200).await;
    env.enable(&repo, "abc").await;
    let notifier = env.notifier(TestEnv::config());

    let first = notifier.process_event(EventBuilder::push(repo.clone()).build()).await;
    assert!(first.is_enqueued());
    notifier.wait_idle().await;
    assert_eq!(env.webhook.request_count("abc").await, 1);

    env.configure(&repo, SlackSettings::disabled()).await;

    let second = notifier.process_event(EventBuilder::push(repo.clone()).sequence(2).build()).await;
    assert!(matches!(second, EventDisposition::Filtered(SuppressReason::NotificationsDisabled)));
    notifier.wait_idle().await;

    assert_eq!(env.webhook.request_count("abc").await, 1, "no POST after disabling");
    assert_eq!(env.recorder.statuses().await, [DeliveryStatus::Delivered]);

    let stats = notifier.stats();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.filtered, 1);
}

#[tokio::test]
async fn retried_event_is_delivered_before_its_successor() {
    let env = TestEnv::new().await;
    let repo = repository("ordered");
    env.webhook.respond_to_body("ordered", "first-branch", 500, 2).await;
    env.webhook.respond_with("ordered", 200).await;
    env.enable(&repo, "ordered").await;
    let notifier = env.notifier(TestEnv::config());

    notifier.process_event(EventBuilder::push(repo.clone()).branch("first-branch").build()).await;
    notifier
        .process_event(EventBuilder::push(repo.clone()).branch("second-branch").sequence(2).build())
        .await;
    notifier.wait_idle().await;

    let texts = env.webhook.posted_texts("ordered").await;
    assert_eq!(texts.len(), 4);
    assert!(texts[..3].iter().all(|text| text.contains("first-branch")));
    assert!(texts[3].contains("second-branch"));

    assert_eq!(env.clock.sleeps(), [Duration::from_secs(1), Duration::from_secs(2)]);

    let outcomes = env.recorder.outcomes().await;
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].attempts, 3);
    assert_eq!(outcomes[1].attempts, 1);
    assert!(outcomes.iter().all(|outcome| outcome.status == DeliveryStatus::Delivered));
}

#[tokio::test]
async fn client_error_is_attempted_once() {
    let env = TestEnv::new().await;
    let repo = repository("gone");
    env.webhook.respond_with("gone", 404).await;
    env.enable(&repo, "gone").await;
    let notifier = env.notifier(TestEnv::config());

    notifier.process_event(EventBuilder::push(repo).build()).await;
    notifier.wait_idle().await;

    assert_eq!(env.webhook.request_count("gone").await, 1);
    let outcomes = env.recorder.outcomes().await;
    assert_eq!(outcomes[0].status, DeliveryStatus::DroppedPermanent);
    assert_eq!(outcomes[0].http_status, Some(404));
    assert_eq!(notifier.stats().dropped_permanent, 1);
    assert!(env.clock.sleeps().is_empty());
}

#[tokio::test]
async fn circuit_opens_then_recovers_after_cooldown() {
    let env = TestEnv::new().await;
    let repo = repository("flaky");
    env.webhook.respond_in_sequence("flaky", &[410, 410, 200]).await;
    env.enable(&repo, "flaky").await;

    let mut config = TestEnv::config();
    config.circuit = CircuitConfig {
        failure_threshold: 2,
        cooldown: Duration::from_secs(60),
        ..CircuitConfig::default()
    };
    let notifier = env.notifier(config);

    for sequence in 1..=3 {
        notifier.process_event(EventBuilder::push(repo.clone()).sequence(sequence).build()).await;
        notifier.wait_idle().await;
    }

    assert_eq!(
        env.recorder.statuses().await,
        [DeliveryStatus::DroppedPermanent, DeliveryStatus::DroppedPermanent, DeliveryStatus::CircuitOpen]
    );
    assert_eq!(env.webhook.request_count("flaky").await, 2, "open circuit issues no request");

    let url = env.webhook.hook_url("flaky");
    assert_eq!(notifier.circuits().state(&url).await, CircuitState::Open);

    env.clock.advance(Duration::from_secs(61));
    notifier.process_event(EventBuilder::push(repo).sequence(4).build()).await;
    notifier.wait_idle().await;

    assert_eq!(env.recorder.statuses().await.last(), Some(&DeliveryStatus::Delivered));
    assert_eq!(env.webhook.request_count("flaky").await, 3);
    assert_eq!(notifier.circuits().state(&url).await, CircuitState::Closed);
    assert_eq!(notifier.stats().circuit_rejected, 1);
}

#[tokio::test]
async fn push_flag_only_mutes_pushes() {
    let env = TestEnv::new().await;
    let repo = repository("prs-only");
    env.webhook.respond_with("prs-only", 200).await;
    env.configure(&repo, push_muted_settings(env.webhook.hook_url("prs-only"))).await;
    let notifier = env.notifier(TestEnv::config());

    let push = notifier.process_event(EventBuilder::push(repo.clone()).build()).await;
    assert!(matches!(push, EventDisposition::Filtered(SuppressReason::PushNotificationsDisabled)));

    let opened = notifier
        .process_event(EventBuilder::pull_request(repo, EventType::PullRequestOpened).sequence(2).build())
        .await;
    assert!(opened.is_enqueued());
    notifier.wait_idle().await;

    let texts = env.webhook.posted_texts("prs-only").await;
    assert_eq!(texts, ["bob opened pull request #42 in PROJ/prs-only"]);
}

#[tokio::test]
async fn drop_oldest_evicts_waiting_message() {
    let env = TestEnv::new().await;
    let repo = repository("busy");
    env.webhook.respond_slowly("busy", Duration::from_millis(300)).await;
    env.enable(&repo, "busy").await;

    let mut config = TestEnv::config();
    config.queue = QueueConfig { capacity: 1, overflow_policy: OverflowPolicy::DropOldest };
    let notifier = env.notifier(config);

    notifier.process_event(EventBuilder::push(repo.clone()).branch("one").build()).await;
    wait_until_dequeued(&notifier).await;

    notifier.process_event(EventBuilder::push(repo.clone()).branch("two").sequence(2).build()).await;
    let third =
        notifier.process_event(EventBuilder::push(repo.clone()).branch("three").sequence(3).build()).await;
    assert!(third.is_enqueued());
    notifier.wait_idle().await;

    let texts = env.webhook.posted_texts("busy").await;
    assert_eq!(texts.len(), 2);
    assert!(texts[0].contains("`one`"));
    assert!(texts[1].contains("`three`"));

    let evictions: Vec<_> = env
        .recorder
        .events()
        .await
        .into_iter()
        .filter(|event| matches!(event, NotificationEvent::QueueOverflow { evicted: true, .. }))
        .collect();
    assert_eq!(evictions.len(), 1);
    assert_eq!(notifier.stats().queue_evicted, 1);
}

#[tokio::test]
async fn reject_newest_refuses_when_full() {
    let env = TestEnv::new().await;
    let repo = repository("busy");
    env.webhook.respond_slowly("busy", Duration::from_millis(300)).await;
    env.enable(&repo, "busy").await;

    let mut config = TestEnv::config();
    config.queue = QueueConfig { capacity: 1, overflow_policy: OverflowPolicy::RejectNewest };
    let notifier = env.notifier(config);

    notifier.process_event(EventBuilder::push(repo.clone()).branch("one").build()).await;
    wait_until_dequeued(&notifier).await;
    notifier.process_event(EventBuilder::push(repo.clone()).branch("two").sequence(2).build()).await;

    let third =
        notifier.process_event(EventBuilder::push(repo.clone()).branch("three").sequence(3).build()).await;
    assert!(matches!(third, EventDisposition::Rejected(DeliveryError::QueueFull { .. })));
    notifier.wait_idle().await;

    let texts = env.webhook.posted_texts("busy").await;
    assert_eq!(texts.len(), 2);
    assert!(texts[1].contains("`two`"));
    assert_eq!(notifier.stats().queue_rejected, 1);
}

#[tokio::test]
async fn retry_after_is_honored() {
    let env = TestEnv::new().await;
    let repo = repository("limited");
    env.webhook.rate_limit_once("limited", 7).await;
    env.webhook.respond_with("limited", 200).await;
    env.enable(&repo, "limited").await;
    let notifier = env.notifier(TestEnv::config());

    notifier.process_event(EventBuilder::push(repo).build()).await;
    notifier.wait_idle().await;

    assert_eq!(env.clock.sleeps(), [Duration::from_secs(7)]);
    let outcomes = env.recorder.outcomes().await;
    assert_eq!(outcomes[0].status, DeliveryStatus::Delivered);
    assert_eq!(outcomes[0].attempts, 2);
}

#[tokio::test]
async fn slow_repository_does_not_block_another() {
    let env = TestEnv::new().await;
    let slow = repository("slow");
    let fast = repository("fast");
    env.webhook.respond_slowly("slow", Duration::from_secs(1)).await;
    env.webhook.respond_with("fast", 200).await;
    env.enable(&slow, "slow").await;
    env.enable(&fast, "fast").await;
    let notifier = env.notifier(TestEnv::config());

    notifier.process_event(EventBuilder::push(slow.clone()).build()).await;
    notifier.process_event(EventBuilder::push(fast.clone()).build()).await;

    env.recorder.wait_for(1).await;
    let outcomes = env.recorder.outcomes().await;
    assert_eq!(outcomes[0].repository_id, fast);

    notifier.wait_idle().await;
    assert_eq!(env.recorder.outcomes().await[1].repository_id, slow);
}

#[tokio::test]
async fn queued_message_is_filtered_when_settings_change() {
    let env = TestEnv::new().await;
    let repo = repository("toggled");
    env.webhook.respond_slowly("toggled", Duration::from_millis(300)).await;
    env.enable(&repo, "toggled").await;
    let notifier = env.notifier(TestEnv::config());

    notifier.process_event(EventBuilder::push(repo.clone()).build()).await;
    wait_until_dequeued(&notifier).await;
    let queued = notifier.process_event(EventBuilder::push(repo.clone()).sequence(2).build()).await;
    assert!(queued.is_enqueued());

    env.settings.put(&repo, SlackSettings::disabled()).await.unwrap();
    notifier.wait_idle().await;

    assert_eq!(env.webhook.request_count("toggled").await, 1);
    assert_eq!(notifier.stats().filtered, 1);
}

#[tokio::test]
async fn run_consumes_stream_until_it_ends() {
    let env = TestEnv::new().await;
    let repo = repository("streamed");
    env.webhook.respond_with("streamed", 200).await;
    env.enable(&repo, "streamed").await;
    let notifier = env.notifier(TestEnv::config());

    let (publisher, events) = event_channel(16);
    for _ in 0..3 {
        publisher
            .publish_now(repo.clone(), EventType::Push, EventBuilder::push(repo.clone()).build().payload)
            .await
            .unwrap();
    }
    drop(publisher);

    tokio::time::timeout(Duration::from_secs(5), notifier.run(events)).await.unwrap();
    notifier.wait_idle().await;

    assert_eq!(env.webhook.request_count("streamed").await, 3);
    assert_eq!(notifier.stats().received, 3);
}

#[tokio::test]
async fn shutdown_stops_intake_and_completes() {
    let env = TestEnv::new().await;
    let repo = repository("closing");
    env.webhook.respond_with("closing", 200).await;
    env.enable(&repo, "closing").await;
    let notifier = env.notifier(TestEnv::config());

    notifier.process_event(EventBuilder::push(repo.clone()).build()).await;
    notifier.wait_idle().await;
    notifier.shutdown().await.unwrap();

    let late = notifier.process_event(EventBuilder::push(repo).sequence(2).build()).await;
    assert!(matches!(late, EventDisposition::Rejected(DeliveryError::QueueClosed)));
    assert_eq!(env.webhook.request_count("closing").await, 1);
}

#[tokio::test]
async fn exhausted_server_errors_do_not_open_circuit() {
    let env = TestEnv::new().await;
    let repo = repository("unstable");
    env.webhook.respond_with("unstable", 503).await;
    env.enable(&repo, "unstable").await;

    let mut config = TestEnv::config();
    config.retry.max_retries = 0;
    config.circuit = CircuitConfig { failure_threshold: 1, ..CircuitConfig::default() };
    let notifier = env.notifier(config);

    for sequence in 1..=2 {
        notifier.process_event(EventBuilder::push(repo.clone()).sequence(sequence).build()).await;
        notifier.wait_idle().await;
    }

    assert_eq!(env.recorder.statuses().await, [DeliveryStatus::Dropped, DeliveryStatus::Dropped]);
    assert_eq!(env.webhook.request_count("unstable").await, 2);
    let url = env.webhook.hook_url("unstable");
    assert_eq!(notifier.circuits().state(&url).await, CircuitState::Closed);
    assert_eq!(notifier.stats().circuit_rejected, 0);
}

#[tokio::test]
async fn blocked_repository_does_not_stall_stream_intake() {
    let env = TestEnv::new().await;
    let slow = repository("slow");
    let fast = repository("fast");
    env.webhook.respond_slowly("slow", Duration::from_secs(1)).await;
    env.webhook.respond_with("fast", 200).await;
    env.enable(&slow, "slow").await;
    env.enable(&fast, "fast").await;

    let mut config = TestEnv::config();
    config.queue = QueueConfig { capacity: 1, overflow_policy: OverflowPolicy::Block };
    let notifier = env.notifier(config);

    let (publisher, events) = event_channel(16);
    let intake = tokio::spawn({
        let notifier = notifier.clone();
        async move { notifier.run(events).await }
    });

    for _ in 0..3 {
        publisher
            .publish_now(slow.clone(), EventType::Push, EventBuilder::push(slow.clone()).build().payload)
            .await
            .unwrap();
    }
    publisher
        .publish_now(fast.clone(), EventType::Push, EventBuilder::push(fast.clone()).build().payload)
        .await
        .unwrap();

    env.recorder.wait_for(1).await;
    let outcomes = env.recorder.outcomes().await;
    assert_eq!(outcomes[0].repository_id, fast);
    assert_eq!(outcomes[0].status, DeliveryStatus::Delivered);

    drop(publisher);
    tokio::time::timeout(Duration::from_secs(10), intake).await.unwrap().unwrap();
    notifier.wait_idle().await;

    assert_eq!(env.webhook.request_count("slow").await, 3, "blocked events wait, none are lost");
    assert_eq!(notifier.stats().queue_rejected, 0);
}

#[tokio::test]
async fn queued_message_follows_updated_webhook_url() {
    let env = TestEnv::new().await;
    let repo = repository("moved");
    env.webhook.respond_slowly("old", Duration::from_millis(300)).await;
    env.webhook.respond_with("new", 200).await;
    env.enable(&repo, "old").await;
    let notifier = env.notifier(TestEnv::config());

    notifier.process_event(EventBuilder::push(repo.clone()).build()).await;
    wait_until_dequeued(&notifier).await;
    let queued = notifier.process_event(EventBuilder::push(repo.clone()).sequence(2).build()).await;
    assert!(queued.is_enqueued());

    env.enable(&repo, "new").await;
    notifier.wait_idle().await;

    assert_eq!(env.webhook.request_count("old").await, 1);
    assert_eq!(env.webhook.request_count("new").await, 1);
    let outcomes = env.recorder.outcomes().await;
    assert_eq!(outcomes[1].target_url, env.webhook.hook_url("new"));
    assert_eq!(outcomes[1].status, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn shutdown_reports_discarded_messages() {
    let env = TestEnv::new().await;
    let repo = repository("pending");
    env.webhook.respond_slowly("pending", Duration::from_millis(300)).await;
    env.enable(&repo, "pending").await;
    let notifier = env.notifier(TestEnv::config());

    notifier.process_event(EventBuilder::push(repo.clone()).build()).await;
    wait_until_dequeued(&notifier).await;
    for sequence in 2..=3 {
        notifier.process_event(EventBuilder::push(repo.clone()).sequence(sequence).build()).await;
    }

    notifier.shutdown().await.unwrap();

    assert_eq!(env.webhook.request_count("pending").await, 1, "in-flight request completes");
    assert_eq!(
        env.recorder.statuses().await,
        [DeliveryStatus::Delivered, DeliveryStatus::Dropped, DeliveryStatus::Dropped]
    );
    let outcomes = env.recorder.outcomes().await;
    assert!(outcomes[1..].iter().all(|o| o.error.as_deref() == Some("discarded at shutdown")));
    let stats = notifier.stats();
    assert_eq!(stats.dropped, 2);
    assert_eq!(stats.queued, 0);
}
