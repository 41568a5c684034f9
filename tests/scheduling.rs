use std::{sync::Arc, time::Duration};

use aide_de_camp_redis::{JobStore, MemoryStore, NewJob, Selection};
use chrono::{DateTime, Utc};

const MAX_RUN_TIME: Duration = Duration::from_secs(600);

fn setup() -> JobStore<MemoryStore> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    JobStore::new(MemoryStore::new(), "delayed_job")
}

fn offset(now: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    now + chrono::Duration::seconds(secs)
}

#[tokio::test]
async fn lock_is_exclusive_until_it_expires() {
    let store = setup();
    let now = store.now();
    store
        .create(NewJob::new("payload").priority(0).run_at(offset(now, -1)))
        .await
        .unwrap();

    let found = store
        .find_available_at(&Selection::new("w1", 5, MAX_RUN_TIME), now)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let mut job = found.into_iter().next().unwrap();
    let mut rival = job.clone();

    assert!(store.lock_exclusively_at(&mut job, MAX_RUN_TIME, "w1", now).await.unwrap());

    assert!(!store.lock_exclusively_at(&mut rival, MAX_RUN_TIME, "w2", now).await.unwrap());
    assert!(!rival.is_locked());
    let stored = store.find(&job.id).await.unwrap();
    assert_eq!(stored.locked_by.as_deref(), Some("w1"));
    assert_eq!(stored.locked_at, Some(now));

    let later = offset(now, 601);
    assert!(store.lock_exclusively_at(&mut rival, MAX_RUN_TIME, "w2", later).await.unwrap());
    assert_eq!(rival.locked_by.as_deref(), Some("w2"));
    let stored = store.find(&job.id).await.unwrap();
    assert_eq!(stored.locked_by.as_deref(), Some("w2"));
    assert_eq!(stored.locked_at, Some(later));
}

#[tokio::test]
async fn locked_job_is_only_offered_to_its_owner() {
    let store = setup();
    let now = store.now();
    let mut job = store
        .create(NewJob::new("p").run_at(offset(now, -1)))
        .await
        .unwrap();
    assert!(store.lock_exclusively_at(&mut job, MAX_RUN_TIME, "w1", now).await.unwrap());

    let for_owner = store
        .find_available_at(&Selection::new("w1", 5, MAX_RUN_TIME), now)
        .await
        .unwrap();
    let for_other = store
        .find_available_at(&Selection::new("w2", 5, MAX_RUN_TIME), now)
        .await
        .unwrap();

    assert_eq!(for_owner, vec![job]);
    assert!(for_other.is_empty());
}

#[tokio::test]
async fn failed_jobs_are_never_candidates() {
    let store = setup();
    let now = store.now();
    for (worker, locked_at) in [(None, None), (Some("w1"), Some(now)), (Some("w2"), Some(offset(now, -3600)))] {
        let mut job = store
            .create(NewJob::new("p").run_at(offset(now, -60)))
            .await
            .unwrap();
        job.failed_at = Some(offset(now, -30));
        job.locked_at = locked_at;
        job.locked_by = worker.map(str::to_string);
        store.save(&mut job).await.unwrap();
    }
    let healthy = store
        .create(NewJob::new("p").run_at(offset(now, -60)))
        .await
        .unwrap();

    let found = store
        .find_available_at(&Selection::new("w1", 10, MAX_RUN_TIME), now)
        .await
        .unwrap();

    assert_eq!(found, vec![healthy]);
}

#[tokio::test]
async fn candidates_are_ranked_and_filtered_by_worker_settings() {
    let store = setup();
    let now = store.now();
    let jobs = [
        (2, -100, "mail"),
        (1, -10, "mail"),
        (1, -20, "mail"),
        (1, -30, "video"),
        (9, -40, "mail"),
        (-5, -50, "mail"),
    ];
    for (priority, age, queue) in jobs {
        store
            .create(
                NewJob::new("p")
                    .priority(priority)
                    .run_at(offset(now, age))
                    .queue(queue),
            )
            .await
            .unwrap();
    }
    let queues = vec!["mail".to_string()];
    let selection = Selection::new("w1", 3, MAX_RUN_TIME)
        .min_priority(0)
        .max_priority(5)
        .queues(&queues);

    let found = store.find_available_at(&selection, now).await.unwrap();

    let ranked: Vec<(i64, DateTime<Utc>)> = found
        .iter()
        .map(|j| (j.priority, j.run_at.unwrap()))
        .collect();
    assert_eq!(
        ranked,
        vec![
            (1, offset(now, -20)),
            (1, offset(now, -10)),
            (2, offset(now, -100)),
        ]
    );
}

#[tokio::test]
async fn clear_locks_frees_jobs_for_other_workers() {
    let store = setup();
    let now = store.now();
    let mut mine = store
        .create(NewJob::new("a").run_at(offset(now, -1)))
        .await
        .unwrap();
    let mut theirs = store
        .create(NewJob::new("b").run_at(offset(now, -1)))
        .await
        .unwrap();
    assert!(store.lock_exclusively_at(&mut mine, MAX_RUN_TIME, "w1", now).await.unwrap());
    assert!(store.lock_exclusively_at(&mut theirs, MAX_RUN_TIME, "w2", now).await.unwrap());

    assert_eq!(store.clear_locks("w1").await.unwrap(), 1);

    let found = store
        .find_available_at(&Selection::new("w3", 5, MAX_RUN_TIME), now)
        .await
        .unwrap();
    assert_eq!(found, vec![mine.clone()]);
    let released = store.find(&mine.id).await.unwrap();
    assert_eq!(released.payload, "a".as_bytes());
    assert!(store.find(&theirs.id).await.unwrap().is_locked());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_workers_get_one_lock() {
    let store = Arc::new(setup());
    let now = store.now();
    let job = store
        .create(NewJob::new("p").run_at(offset(now, -1)))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for n in 0..8 {
        let store = Arc::clone(&store);
        let mut candidate = job.clone();
        tasks.push(tokio::spawn(async move {
            let worker = format!("w{n}");
            store
                .lock_exclusively_at(&mut candidate, MAX_RUN_TIME, &worker, now)
                .await
                .unwrap()
                .then_some(worker)
        }));
    }

    let mut winners = Vec::new();
    for task in tasks {
        if let Some(worker) = task.await.unwrap() {
            winners.push(worker);
        }
    }

    assert_eq!(winners.len(), 1);
    let stored = store.find(&job.id).await.unwrap();
    assert_eq!(stored.locked_by.as_deref(), Some(winners[0].as_str()));
}
