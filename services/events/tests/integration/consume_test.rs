use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use quest_events::domain::repository::{EventBus, EventLog};
use quest_events::domain::types::EventEnvelope;
use quest_events::error::EventsError;
use quest_events::infra::memory::{MemoryDedupStore, MemoryEventLog};
use quest_events::usecase::consume::{ConsumerOptions, StreamConsumer};
use quest_events::usecase::dedup::Deduplicated;

use crate::helpers::{
    FailingDedupStore, FlakyLog, Recorder, envelope, new_event, numbered, panicking_handler,
};

const QUEST: &str = "quest.completed.v1";
const TAG: &str = "tag.created.v1";

fn consumer(log: &Arc<MemoryEventLog>, name: &str) -> StreamConsumer<MemoryEventLog> {
    StreamConsumer::new(Arc::clone(log), ConsumerOptions::new("rewards", name))
}

async fn append_all(log: &MemoryEventLog, envelopes: &[EventEnvelope]) {
    for envelope in envelopes {
        log.append(envelope).await.unwrap();
    }
}

#[tokio::test]
async fn should_deliver_each_topic_in_creation_order() {
    let log = Arc::new(MemoryEventLog::new());
    append_all(
        &log,
        &[envelope(QUEST, 1), envelope(TAG, 10), envelope(QUEST, 2), envelope(QUEST, 3)],
    )
    .await;
    let quests = Recorder::default();
    let tags = Recorder::default();
    let bus = consumer(&log, "c1");
    bus.subscribe(QUEST, Arc::new(quests.handler()));
    bus.subscribe(TAG, Arc::new(tags.handler()));

    let report = bus.poll_once(Duration::ZERO, 10).await.unwrap();

    assert_eq!(report.delivered, 4);
    assert_eq!(report.acked, 4);
    assert_eq!(quests.numbers(), vec![1, 2, 3]);
    assert_eq!(tags.numbers(), vec![10]);
    assert_eq!(log.pending_count(QUEST, "rewards").await, 0);
}

#[tokio::test]
async fn should_redeliver_until_handler_succeeds() {
    let log = Arc::new(MemoryEventLog::new());
    append_all(&log, &[envelope(QUEST, 1)]).await;
    let recorder = Recorder::default();
    let bus = consumer(&log, "c1");
    bus.subscribe(QUEST, Arc::new(recorder.flaky_handler(2)));

    let first = bus.poll_once(Duration::ZERO, 10).await.unwrap();
    let second = bus.poll_once(Duration::ZERO, 10).await.unwrap();
    let third = bus.poll_once(Duration::ZERO, 10).await.unwrap();
    let idle = bus.poll_once(Duration::ZERO, 10).await.unwrap();

    assert_eq!((first.failed, second.failed, third.acked), (1, 1, 1));
    assert_eq!(idle.delivered, 0, "acked entries are not delivered again");
    assert_eq!(recorder.numbers(), vec![1, 1, 1]);
    assert_eq!(log.pending_count(QUEST, "rewards").await, 0);
}

#[tokio::test]
async fn should_hold_topic_behind_failing_entry_without_blocking_others() {
    let log = Arc::new(MemoryEventLog::new());
    append_all(&log, &[envelope(QUEST, 1), envelope(QUEST, 2), envelope(TAG, 10)]).await;
    let quests = Recorder::default();
    let tags = Recorder::default();
    let bus = consumer(&log, "c1");
    bus.subscribe(QUEST, Arc::new(quests.failing_on(1)));
    bus.subscribe(TAG, Arc::new(tags.handler()));

    bus.poll_once(Duration::ZERO, 10).await.unwrap();
    bus.poll_once(Duration::ZERO, 10).await.unwrap();

    assert_eq!(quests.numbers(), vec![1, 1], "entry 2 must wait behind entry 1");
    assert_eq!(tags.numbers(), vec![10]);
    assert_eq!(log.pending_count(QUEST, "rewards").await, 2);
}

#[tokio::test]
async fn should_resume_topic_in_order_once_failure_clears() {
    let log = Arc::new(MemoryEventLog::new());
    append_all(&log, &[envelope(QUEST, 1), envelope(QUEST, 2)]).await;
    let recorder = Recorder::default();
    let bus = consumer(&log, "c1");
    bus.subscribe(QUEST, Arc::new(recorder.flaky_handler(1)));

    bus.poll_once(Duration::ZERO, 10).await.unwrap();
    append_all(&log, &[envelope(QUEST, 3)]).await;
    bus.poll_once(Duration::ZERO, 10).await.unwrap();

    assert_eq!(recorder.numbers(), vec![1, 1, 2, 3]);
    assert_eq!(log.pending_count(QUEST, "rewards").await, 0);
}

#[tokio::test]
async fn should_run_other_handlers_when_one_panics() {
    let log = Arc::new(MemoryEventLog::new());
    append_all(&log, &[envelope(TAG, 1)]).await;
    let recorder = Recorder::default();
    let bus = consumer(&log, "c1");
    bus.subscribe(TAG, Arc::new(panicking_handler()));
    bus.subscribe(TAG, Arc::new(recorder.handler()));

    let first = bus.poll_once(Duration::ZERO, 10).await.unwrap();
    let second = bus.poll_once(Duration::ZERO, 10).await.unwrap();

    assert_eq!(first.failed, 1);
    assert_eq!(second.failed, 1);
    // The healthy handler sees the redelivery too; it must be idempotent.
    assert_eq!(recorder.count(), 2);
}

#[tokio::test]
async fn should_keep_groups_independent() {
    let log = Arc::new(MemoryEventLog::new());
    append_all(&log, &[envelope(TAG, 1)]).await;
    let rewards = Recorder::default();
    let search = Recorder::default();
    let rewards_bus = consumer(&log, "c1");
    rewards_bus.subscribe(TAG, Arc::new(rewards.flaky_handler(1)));
    let search_bus = StreamConsumer::new(Arc::clone(&log), ConsumerOptions::new("search", "c1"));
    search_bus.subscribe(TAG, Arc::new(search.handler()));

    rewards_bus.poll_once(Duration::ZERO, 10).await.unwrap();
    search_bus.poll_once(Duration::ZERO, 10).await.unwrap();

    assert_eq!(search.count(), 1);
    assert_eq!(log.pending_count(TAG, "rewards").await, 1);
    assert_eq!(log.pending_count(TAG, "search").await, 0);
}

#[tokio::test]
async fn should_collapse_duplicate_dedup_keys_for_dedup_aware_handler() {
    let log = Arc::new(MemoryEventLog::new());
    let mut first = new_event(QUEST, json!({ "quest_id": "q1", "user_id": "u1" }));
    first.dedup_key = Some("quest:q1:u1".to_owned());
    let mut second = new_event(QUEST, json!({ "quest_id": "q1", "user_id": "u1" }));
    second.dedup_key = Some("quest:q1:u1".to_owned());
    append_all(&log, &[first.envelope(), second.envelope()]).await;

    let aware = Recorder::default();
    let unaware = Recorder::default();
    let bus = consumer(&log, "c1");
    bus.subscribe(
        QUEST,
        Arc::new(Deduplicated::new(
            Arc::new(MemoryDedupStore::new()),
            "rewards",
            Duration::from_secs(3600),
            aware.handler(),
        )),
    );
    bus.subscribe(QUEST, Arc::new(unaware.handler()));

    bus.poll_once(Duration::ZERO, 10).await.unwrap();

    assert_eq!(aware.count(), 1);
    assert_eq!(unaware.count(), 2);
}

#[tokio::test]
async fn should_skip_dedup_handler_on_redelivery_after_success() {
    let log = Arc::new(MemoryEventLog::new());
    append_all(&log, &[envelope(QUEST, 1)]).await;
    let aware = Recorder::default();
    let flaky = Recorder::default();
    let bus = consumer(&log, "c1");
    bus.subscribe(
        QUEST,
        Arc::new(Deduplicated::new(
            Arc::new(MemoryDedupStore::new()),
            "rewards",
            Duration::from_secs(3600),
            aware.handler(),
        )),
    );
    bus.subscribe(QUEST, Arc::new(flaky.flaky_handler(1)));

    bus.poll_once(Duration::ZERO, 10).await.unwrap();
    bus.poll_once(Duration::ZERO, 10).await.unwrap();

    assert_eq!(aware.count(), 1);
    assert_eq!(flaky.count(), 2);
    assert_eq!(log.pending_count(QUEST, "rewards").await, 0);
}

#[tokio::test]
async fn should_run_dedup_handler_once_across_competing_consumers() {
    let log = Arc::new(MemoryEventLog::new());
    let mut first = new_event(QUEST, json!({ "quest_id": "q1", "user_id": "u1" }));
    first.dedup_key = Some("quest:q1:u1".to_owned());
    let mut second = new_event(QUEST, json!({ "quest_id": "q1", "user_id": "u1" }));
    second.dedup_key = Some("quest:q1:u1".to_owned());
    append_all(&log, &[first.envelope(), second.envelope()]).await;

    let store = Arc::new(MemoryDedupStore::new());
    let aware = Recorder::default();
    let c1 = consumer(&log, "c1");
    let c2 = consumer(&log, "c2");
    for bus in [&c1, &c2] {
        bus.subscribe(
            QUEST,
            Arc::new(Deduplicated::new(
                Arc::clone(&store),
                "rewards",
                Duration::from_secs(3600),
                aware.slow_handler(Duration::from_millis(50)),
            )),
        );
    }

    let (r1, r2) = tokio::join!(
        c1.poll_once(Duration::ZERO, 1),
        c2.poll_once(Duration::ZERO, 1)
    );
    let (r1, r2) = (r1.unwrap(), r2.unwrap());

    assert_eq!((r1.delivered, r2.delivered), (1, 1), "each consumer got one entry");
    assert_eq!(r1.acked + r2.acked, 2);
    assert_eq!(aware.count(), 1);
    assert_eq!(log.pending_count(QUEST, "rewards").await, 0);
}

#[tokio::test]
async fn should_release_dedup_claim_when_handler_fails() {
    let log = Arc::new(MemoryEventLog::new());
    append_all(&log, &[envelope(QUEST, 1)]).await;
    let aware = Recorder::default();
    let bus = consumer(&log, "c1");
    bus.subscribe(
        QUEST,
        Arc::new(Deduplicated::new(
            Arc::new(MemoryDedupStore::new()),
            "rewards",
            Duration::from_secs(3600),
            aware.flaky_handler(1),
        )),
    );

    let first = bus.poll_once(Duration::ZERO, 10).await.unwrap();
    let second = bus.poll_once(Duration::ZERO, 10).await.unwrap();

    assert_eq!(first.failed, 1);
    assert_eq!(second.acked, 1);
    assert_eq!(aware.count(), 2, "redelivery ran the handler again");
    assert_eq!(log.pending_count(QUEST, "rewards").await, 0);
}

#[tokio::test]
async fn should_recreate_group_after_stream_deleted() {
    let log = Arc::new(MemoryEventLog::new());
    let recorder = Recorder::default();
    let bus = consumer(&log, "c1");
    bus.subscribe(QUEST, Arc::new(recorder.handler()));
    bus.poll_once(Duration::ZERO, 10).await.unwrap();

    log.delete_stream(QUEST).await;
    log.append(&envelope(QUEST, 1)).await.unwrap();

    let err = bus.poll_once(Duration::ZERO, 10).await.unwrap_err();
    assert!(
        matches!(&err, EventsError::GroupMissing { group, .. } if group == "rewards"),
        "expected GroupMissing, got {err:?}"
    );
    let report = bus.poll_once(Duration::ZERO, 10).await.unwrap();

    assert_eq!(report.acked, 1);
    assert_eq!(recorder.numbers(), vec![1]);
    assert_eq!(log.pending_count(QUEST, "rewards").await, 0);
}

#[tokio::test]
async fn should_leave_entry_pending_when_dedup_store_unreadable() {
    let log = Arc::new(MemoryEventLog::new());
    append_all(&log, &[envelope(QUEST, 1)]).await;
    let recorder = Recorder::default();
    let bus = consumer(&log, "c1");
    bus.subscribe(
        QUEST,
        Arc::new(Deduplicated::new(
            Arc::new(FailingDedupStore),
            "rewards",
            Duration::from_secs(3600),
            recorder.handler(),
        )),
    );

    let report = bus.poll_once(Duration::ZERO, 10).await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(recorder.count(), 0);
    assert_eq!(log.pending_count(QUEST, "rewards").await, 1);
}

#[tokio::test(start_paused = true)]
async fn should_take_over_entries_idle_on_another_consumer() {
    let log = Arc::new(MemoryEventLog::new());
    append_all(&log, &[numbered(QUEST, 1).envelope()]).await;
    let stuck = Recorder::default();
    let dead = consumer(&log, "c1");
    dead.subscribe(QUEST, Arc::new(stuck.flaky_handler(usize::MAX)));
    dead.poll_once(Duration::ZERO, 10).await.unwrap();

    let recorder = Recorder::default();
    let survivor = StreamConsumer::new(
        Arc::clone(&log),
        ConsumerOptions::new("rewards", "c2").with_claim_idle(Duration::from_secs(60)),
    );
    survivor.subscribe(QUEST, Arc::new(recorder.handler()));

    survivor.poll_once(Duration::ZERO, 10).await.unwrap();
    assert_eq!(recorder.count(), 0, "entry is not idle yet");

    tokio::time::advance(Duration::from_secs(61)).await;
    let report = survivor.poll_once(Duration::ZERO, 10).await.unwrap();

    assert_eq!(report.acked, 1);
    assert_eq!(recorder.numbers(), vec![1]);
    assert_eq!(log.pending_count(QUEST, "rewards").await, 0);
}

#[tokio::test]
async fn should_stop_run_loop() {
    let log = Arc::new(MemoryEventLog::new());
    let recorder = Recorder::default();
    let bus = Arc::new(consumer(&log, "c1"));
    bus.subscribe(TAG, Arc::new(recorder.handler()));

    let runner = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move { bus.run(Some(20), Some(10)).await })
    };
    log.append(&envelope(TAG, 1)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while recorder.count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("event delivered by run loop");

    bus.stop();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("run returned after stop")
        .unwrap()
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn should_back_off_and_recover_after_log_errors() {
    let log = Arc::new(FlakyLog::default());
    log.inner.append(&envelope(TAG, 1)).await.unwrap();
    log.fail_reads(3);
    let recorder = Recorder::default();
    let bus = Arc::new(StreamConsumer::new(
        Arc::clone(&log),
        ConsumerOptions::new("rewards", "c1"),
    ));
    bus.subscribe(TAG, Arc::new(recorder.handler()));

    let started = tokio::time::Instant::now();
    let runner = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move { bus.run(Some(20), Some(10)).await })
    };
    tokio::time::timeout(Duration::from_secs(60), async {
        while recorder.count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("event delivered after the log recovered");

    assert_eq!(log.read_failures_left(), 0);
    // Three failed passes wait at least 100 + 200 + 400 ms.
    assert!(started.elapsed() >= Duration::from_millis(700));
    assert_eq!(recorder.numbers(), vec![1]);

    bus.stop();
    tokio::time::timeout(Duration::from_secs(60), runner)
        .await
        .expect("run returned after stop")
        .unwrap()
        .unwrap();
    assert_eq!(log.inner.pending_count(TAG, "rewards").await, 0);
}
