use std::{sync::Arc, time::Duration};

use common::{TOPIC, avro_fixture, options, primary_key, user, user_key};
use pdk_ingestor_core::{
    BusSource, IdAssignment, Mapper, MemoryConsumer, MemorySink, Pipeline, Ref,
};
use tokio_util::sync::CancellationToken;

mod common;

fn id_mapper() -> Mapper {
    Mapper::new(IdAssignment::IdField("user_id".to_string()))
}

async fn wait_for_delivery(consumer: &MemoryConsumer, count: usize) {
    while consumer.delivered() < count {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test]
async fn test_primary_key_record() {
    let fixture = avro_fixture().await;
    let consumer = Arc::new(MemoryConsumer::new());
    consumer.send(TOPIC, 0, fixture.frame(&user(159)));
    consumer.close();

    let sink = Arc::new(MemorySink::new());
    let mapper = Mapper::new(primary_key()).with_packed_bools("bools");
    let report = fixture
        .run(consumer.clone(), mapper, sink.clone(), options(1))
        .await
        .unwrap();

    let key = user_key();
    assert!(sink.contains("abc", "2", key.clone()));
    assert!(sink.contains("db", "1", key.clone()));
    assert!(sink.contains("bools", "all_users", key.clone()));
    assert!(sink.contains("bools-exists", "all_users", key.clone()));
    assert!(sink.contains("bools-exists", "has_deleted_date", key.clone()));
    assert!(!sink.contains("bools", "has_deleted_date", key.clone()));
    assert!(sink.contains("central_group", "cgr", key.clone()));
    assert!(sink.contains("custom_audiences", "a", key.clone()));
    assert!(sink.contains("custom_audiences", "b", key.clone()));
    assert!(sink.contains("desktop_frequency", 7u64, key.clone()));
    assert!(sink.contains("ddd_cc_checking", 5u64, key.clone()));
    assert!(sink.contains("survey1234", "yes", key.clone()));
    assert!(sink.contains("days_since_last_logon", 8u64, key.clone()));

    let batches = sink.batches();
    assert!(batches.iter().all(|batch| batch.len() == 1));
    assert!(
        batches
            .iter()
            .flat_map(|batch| &batch.mutations)
            .all(|mutation| mutation.column == key)
    );
    assert!(sink.rows("all_users").is_empty());

    assert_eq!(report.records, 1);
    assert_eq!(report.mutations as usize, batches.len());
    assert_eq!(consumer.committed(TOPIC, 0), Some(1));
}

#[tokio::test]
async fn test_id_field_record() {
    let fixture = avro_fixture().await;
    let consumer = Arc::new(MemoryConsumer::new());
    consumer.send(TOPIC, 0, fixture.frame(&user(159)));
    consumer.close();

    let sink = Arc::new(MemorySink::new());
    let mapper = id_mapper().with_packed_bools("bools");
    fixture
        .run(consumer, mapper, sink.clone(), options(1))
        .await
        .unwrap();

    let column = Ref::Id(159);
    assert!(sink.contains("abc", "2", column.clone()));
    assert!(sink.contains("bools", "all_users", column.clone()));
    assert!(sink.contains("desktop_frequency", 7u64, column.clone()));
    assert!(sink.contains("days_since_last_logon", 8u64, column.clone()));
    assert!(sink.rows("user_id").is_empty());
    assert!(
        sink.batches()
            .iter()
            .flat_map(|batch| &batch.mutations)
            .all(|mutation| mutation.column == column)
    );
}

#[tokio::test]
async fn test_malformed_frame_is_skipped() {
    let fixture = avro_fixture().await;
    let consumer = Arc::new(MemoryConsumer::new());
    consumer.send(TOPIC, 0, fixture.frame(&user(1)));
    consumer.send(TOPIC, 0, &b"not an avro frame"[..]);
    consumer.send(TOPIC, 0, fixture.frame(&user(2)));
    consumer.close();

    let sink = Arc::new(MemorySink::new());
    let report = fixture
        .run(consumer.clone(), id_mapper(), sink.clone(), options(100))
        .await
        .unwrap();

    assert_eq!(report.malformed_records, 1);
    assert_eq!(report.records, 2);
    assert_eq!(
        sink.rows("central_group"),
        vec![
            (Ref::from("cgr"), Ref::Id(1)),
            (Ref::from("cgr"), Ref::Id(2)),
        ]
    );
    assert_eq!(consumer.committed(TOPIC, 0), Some(3));
}

#[tokio::test]
async fn test_unknown_schema_blocks_commits() {
    let fixture = avro_fixture().await;
    let consumer = Arc::new(MemoryConsumer::new());
    consumer.send(TOPIC, 0, fixture.frame(&user(1)));
    consumer.send(TOPIC, 0, &[0u8, 0, 0, 0, 99, 1, 2][..]);
    consumer.send(TOPIC, 0, fixture.frame(&user(2)));
    consumer.send(TOPIC, 1, fixture.frame(&user(3)));
    consumer.close();

    let sink = Arc::new(MemorySink::new());
    let report = fixture
        .run(consumer.clone(), id_mapper(), sink.clone(), options(100))
        .await
        .unwrap();

    assert_eq!(report.schema_errors, 1);
    assert_eq!(report.records, 3);
    assert!(sink.contains("central_group", "cgr", 2u64));
    assert_eq!(consumer.committed(TOPIC, 0), Some(1));
    assert_eq!(consumer.committed(TOPIC, 1), Some(1));
}

#[tokio::test]
async fn test_max_msgs_stops_the_pipeline() {
    let fixture = avro_fixture().await;
    let consumer = Arc::new(MemoryConsumer::new());
    for user_id in 0..10 {
        consumer.send(TOPIC, 0, fixture.frame(&user(user_id)));
    }

    let sink = Arc::new(MemorySink::new());
    let mut options = options(100);
    options.max_msgs = 3;
    let report = fixture
        .run(consumer.clone(), id_mapper(), sink.clone(), options)
        .await
        .unwrap();

    assert_eq!(report.records, 3);
    assert_eq!(
        sink.rows("central_group")
            .into_iter()
            .map(|(_, column)| column)
            .collect::<Vec<_>>(),
        vec![Ref::Id(0), Ref::Id(1), Ref::Id(2)]
    );
    assert_eq!(consumer.committed(TOPIC, 0), Some(3));
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failure_is_applied_once() {
    let fixture = avro_fixture().await;
    let consumer = Arc::new(MemoryConsumer::new());
    consumer.send(TOPIC, 0, fixture.frame(&user(1)));
    consumer.close();

    let sink = Arc::new(MemorySink::new());
    sink.fail_next(1);
    let report = fixture
        .run(consumer.clone(), id_mapper(), sink.clone(), options(100))
        .await
        .unwrap();

    let batches = sink.batches();
    let mut fields = batches
        .iter()
        .map(|batch| batch.field.name.clone())
        .collect::<Vec<_>>();
    let applied = fields.len();
    fields.sort();
    fields.dedup();

    assert_eq!(fields.len(), applied);
    assert_eq!(sink.attempts(), applied + 1);
    assert_eq!(report.sink_retries, 1);
    assert_eq!(report.batches_dead_lettered, 0);
    assert_eq!(consumer.committed(TOPIC, 0), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_dead_lettered_batch_is_not_committed() {
    let fixture = avro_fixture().await;
    let dir = tempfile::tempdir().unwrap();
    let dead_letter_path = dir.path().join("dead.jsonl");

    let consumer = Arc::new(MemoryConsumer::new());
    consumer.send(TOPIC, 0, fixture.frame(&user(1)));
    consumer.close();

    let sink = Arc::new(MemorySink::new());
    sink.reject_next();
    let mut options = options(100);
    options.dead_letter_file = Some(dead_letter_path.clone());
    let report = fixture
        .run(consumer.clone(), id_mapper(), sink.clone(), options)
        .await
        .unwrap();

    assert_eq!(report.batches_dead_lettered, 1);
    assert_eq!(consumer.committed(TOPIC, 0), None);

    let dead_letters = std::fs::read_to_string(&dead_letter_path).unwrap();
    assert_eq!(dead_letters.lines().count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_commits_nothing_unacknowledged() {
    let fixture = avro_fixture().await;
    let consumer = Arc::new(MemoryConsumer::new());
    for user_id in 0..3 {
        consumer.send(TOPIC, 0, fixture.frame(&user(user_id)));
    }

    let sink = Arc::new(MemorySink::new());
    sink.block();

    let mut options = options(1);
    options.batcher.shutdown_flush_timeout = Duration::from_millis(100);
    let pipeline = Pipeline::new(
        BusSource::new(consumer.clone()),
        fixture.decoder.clone(),
        id_mapper(),
        sink.clone(),
        options,
    );

    let ct = CancellationToken::new();
    let run = tokio::spawn(pipeline.run(ct.clone()));

    wait_for_delivery(&consumer, 3).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    ct.cancel();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.batches_applied, 0);
    assert_eq!(report.offsets_committed, 0);
    assert_eq!(consumer.committed(TOPIC, 0), None);
}

#[tokio::test(start_paused = true)]
async fn test_blocked_sink_stops_consumption() {
    let fixture = avro_fixture().await;
    let consumer = Arc::new(MemoryConsumer::new());
    for user_id in 0..100 {
        consumer.send(TOPIC, 0, fixture.frame(&user(user_id)));
    }

    let sink = Arc::new(MemorySink::new());
    sink.block();

    let mut options = options(1);
    options.concurrency = 1;
    options.buffer_size = 1;
    let pipeline = Pipeline::new(
        BusSource::new(consumer.clone()),
        fixture.decoder.clone(),
        id_mapper(),
        sink.clone(),
        options,
    );
    let run = tokio::spawn(pipeline.run(CancellationToken::new()));

    tokio::time::sleep(Duration::from_secs(1)).await;
    let delivered = consumer.delivered();
    assert!(delivered < 10, "consumed {delivered} messages while blocked");

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(consumer.delivered(), delivered);

    sink.unblock();
    consumer.close();
    let report = run.await.unwrap().unwrap();
    assert_eq!(report.records, 100);
    assert_eq!(consumer.committed(TOPIC, 0), Some(100));
}

#[tokio::test]
async fn test_ingestion_is_idempotent() {
    let fixture = avro_fixture().await;
    let sink = Arc::new(MemorySink::new());

    let mut states = Vec::new();
    for _ in 0..2 {
        let consumer = Arc::new(MemoryConsumer::new());
        for user_id in 0..5 {
            consumer.send(TOPIC, user_id as i32 % 2, fixture.frame(&user(user_id)));
        }
        consumer.close();

        fixture
            .run(consumer, id_mapper(), sink.clone(), options(3))
            .await
            .unwrap();
        states.push(sink.state());
    }

    assert_eq!(states[0], states[1]);
    assert_eq!(sink.rows("central_group").len(), 5);
}
