//! SQLite job store semantics against a temporary database file

use std::collections::HashSet;
use std::sync::Arc;

use cadence_persist::{connect, SqliteConfig, SqliteQueueBackend};
use cadence_queue::{
    CreatedRange, DeadLetterFilter, JobStatus, NewJob, OrderBy, OrderDir, QueueBackend,
    QueueError, RequeueOutcome,
};
use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;

async fn open(dir: &TempDir) -> Result<SqliteQueueBackend, Box<dyn std::error::Error>> {
    let path = dir.path().join("queue.db");
    let config = SqliteConfig {
        max_connections: 8,
        ..SqliteConfig::new(format!("sqlite://{}?mode=rwc", path.display()))
    };
    Ok(SqliteQueueBackend::new(connect(&config).await?))
}

fn vt() -> Duration {
    Duration::seconds(30)
}

#[tokio::test]
async fn test_enqueue_lease_ack_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let store = open(&dir).await?;
    let now = Utc::now();

    let id = store
        .enqueue(NewJob::new("watchlist", json!({ "artist_id": 7 })), now)
        .await?;

    let leased = store.lease("watchlist", 10, "w-1", vt(), now).await?;
    assert_eq!(leased.len(), 1);
    let job = &leased[0];
    assert_eq!(job.id, id);
    assert_eq!(job.status, JobStatus::Leased);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.payload["artist_id"], 7);
    assert_eq!(job.lease_owner.as_deref(), Some("w-1"));
    assert_eq!(
        job.lease_expires_at.map(|t| t.timestamp_millis()),
        Some((now + vt()).timestamp_millis())
    );

    store.ack(id, "w-1", now).await?;
    // Retried ack is a no-op
    store.ack(id, "w-1", now).await?;
    let job = store.get_job(id).await?.expect("job exists");
    assert_eq!(job.status, JobStatus::Done);

    assert!(store.is_healthy().await);
    Ok(())
}

#[tokio::test]
async fn test_priority_then_fifo_ordering() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let store = open(&dir).await?;
    let t0 = Utc::now();

    let low = store
        .enqueue(NewJob::new("watchlist", json!({})).priority(5), t0)
        .await?;
    let first = store
        .enqueue(NewJob::new("watchlist", json!({})).priority(0), t0 + Duration::milliseconds(1))
        .await?;
    let second = store
        .enqueue(NewJob::new("watchlist", json!({})).priority(0), t0 + Duration::milliseconds(2))
        .await?;

    let now = t0 + Duration::seconds(1);
    let one = store.lease("watchlist", 1, "w", vt(), now).await?;
    assert_eq!(one[0].id, first);

    let rest = store.lease("watchlist", 10, "w", vt(), now).await?;
    let ids: Vec<_> = rest.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![second, low]);
    Ok(())
}

#[tokio::test]
async fn test_delayed_job_not_visible_early() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let store = open(&dir).await?;
    let now = Utc::now();

    store
        .enqueue(
            NewJob::new("watchlist", json!({})).visible_at(now + Duration::seconds(10)),
            now,
        )
        .await?;

    assert!(store.lease("watchlist", 1, "w", vt(), now).await?.is_empty());
    let later = store
        .lease("watchlist", 1, "w", vt(), now + Duration::seconds(10))
        .await?;
    assert_eq!(later.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_leases_are_disjoint() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let store = Arc::new(open(&dir).await?);
    let now = Utc::now();

    for i in 0..100 {
        store
            .enqueue(NewJob::new("watchlist", json!({ "i": i })), now)
            .await?;
    }

    let tasks = (0..6).map(|w| {
        let store = store.clone();
        tokio::spawn(async move {
            let owner = format!("worker-{}", w);
            let mut ids = Vec::new();
            loop {
                match store.lease("watchlist", 5, &owner, vt(), now).await {
                    Ok(batch) if batch.is_empty() => break,
                    Ok(batch) => ids.extend(batch.into_iter().map(|j| j.id)),
                    // Busy database; try again
                    Err(QueueError::Unavailable(_)) => tokio::task::yield_now().await,
                    Err(e) => panic!("lease failed: {}", e),
                }
            }
            ids
        })
    });

    let mut all = Vec::new();
    for ids in futures::future::join_all(tasks).await {
        all.extend(ids?);
    }
    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 100);
    assert_eq!(unique.len(), 100);
    Ok(())
}

#[tokio::test]
async fn test_expired_lease_recovered() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let store = open(&dir).await?;
    let now = Utc::now();

    let id = store.enqueue(NewJob::new("watchlist", json!({})), now).await?;
    store
        .lease("watchlist", 1, "crashed", Duration::seconds(10), now)
        .await?;

    // Not before expiry
    let early = now + Duration::seconds(5);
    assert_eq!(store.reap_expired(early).await?, 0);
    assert!(store.lease("watchlist", 1, "rescuer", vt(), early).await?.is_empty());

    let late = now + Duration::seconds(11);
    assert_eq!(store.reap_expired(late).await?, 1);
    let job = store.get_job(id).await?.expect("job exists");
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.lease_owner.is_none());

    let again = store.lease("watchlist", 1, "rescuer", vt(), late).await?;
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].attempts, 2);

    let err = store.ack(id, "crashed", late).await.unwrap_err();
    assert!(matches!(err, QueueError::LeaseLost { .. }));
    Ok(())
}

#[tokio::test]
async fn test_expired_lease_is_directly_leasable() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let store = open(&dir).await?;
    let now = Utc::now();

    let id = store.enqueue(NewJob::new("watchlist", json!({})), now).await?;
    store
        .lease("watchlist", 1, "crashed", Duration::seconds(10), now)
        .await?;

    let later = now + Duration::seconds(11);
    let leased = store.lease("watchlist", 1, "rescuer", vt(), later).await?;
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].id, id);
    assert_eq!(leased[0].lease_owner.as_deref(), Some("rescuer"));
    Ok(())
}

#[tokio::test]
async fn test_idempotent_enqueue() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let store = open(&dir).await?;
    let now = Utc::now();
    let job = || NewJob::new("watchlist", json!({ "artist": 3 })).idempotency_key("artist-3");

    let a = store.enqueue(job(), now).await?;
    let b = store.enqueue(job(), now).await?;
    assert_eq!(a, b);

    store.lease("watchlist", 1, "w", vt(), now).await?;
    assert_eq!(store.enqueue(job(), now).await?, a);

    // Same key, different kind
    let other = store
        .enqueue(NewJob::new("metadata_refresh", json!({})).idempotency_key("artist-3"), now)
        .await?;
    assert_ne!(other, a);

    // Terminal rows release the key
    store.ack(a, "w", now).await?;
    let c = store.enqueue(job(), now).await?;
    assert_ne!(c, a);
    Ok(())
}

#[tokio::test]
async fn test_ownership_checks() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let store = open(&dir).await?;
    let now = Utc::now();

    let id = store.enqueue(NewJob::new("watchlist", json!({})), now).await?;
    store.lease("watchlist", 1, "owner-a", vt(), now).await?;

    for result in [
        store.ack(id, "owner-b", now).await,
        store.reschedule(id, "owner-b", "x", now, now).await,
        store.dead_letter(id, "owner-b", "x", now).await,
    ] {
        assert!(matches!(result, Err(QueueError::LeaseLost { .. })));
    }
    assert!(matches!(
        store.extend_lease(id, "owner-b", vt(), now).await,
        Err(QueueError::LeaseLost { .. })
    ));
    assert!(matches!(
        store.ack(404, "owner-a", now).await,
        Err(QueueError::NotFound(404))
    ));

    let extended = store
        .extend_lease(id, "owner-a", Duration::seconds(90), now)
        .await?;
    assert_eq!(extended.timestamp_millis(), (now + Duration::seconds(90)).timestamp_millis());
    Ok(())
}

#[tokio::test]
async fn test_reschedule_and_dead_letter() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let store = open(&dir).await?;
    let now = Utc::now();

    let id = store.enqueue(NewJob::new("watchlist", json!({})), now).await?;
    store.lease("watchlist", 1, "w", vt(), now).await?;

    let retry_at = now + Duration::seconds(30);
    store
        .reschedule(id, "w", "network timeout", retry_at, now)
        .await?;
    let job = store.get_job(id).await?.expect("job exists");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.last_error.as_deref(), Some("network timeout"));
    assert_eq!(job.visible_at.timestamp_millis(), retry_at.timestamp_millis());
    assert!(store.lease("watchlist", 1, "w", vt(), now).await?.is_empty());

    store.lease("watchlist", 1, "w", vt(), retry_at).await?;
    store.dead_letter(id, "w", "http 500 upstream", retry_at).await?;
    let job = store.get_job(id).await?.expect("job exists");
    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.attempts, 2);
    assert!(job.lease_owner.is_none());
    Ok(())
}

#[tokio::test]
async fn test_dead_letter_listing_requeue_and_delete() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let store = open(&dir).await?;
    let jan = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
    let feb = Utc.with_ymd_and_hms(2025, 2, 10, 0, 0, 0).unwrap();

    let mut dead = Vec::new();
    for when in [jan, feb] {
        let id = store
            .enqueue(NewJob::new("watchlist", json!({})).idempotency_key(format!("k-{}", when)), when)
            .await?;
        store.lease("watchlist", 1, "w", vt(), when).await?;
        store.dead_letter(id, "w", "network down", when).await?;
        dead.push(id);
    }

    let all = store
        .dead_letter_summaries(&DeadLetterFilter::Created(CreatedRange::default()))
        .await?;
    assert_eq!(all.iter().map(|s| s.id).collect::<Vec<_>>(), dead);
    assert_eq!(all[0].last_error.as_deref(), Some("network down"));

    let before_feb = store
        .dead_letter_summaries(&DeadLetterFilter::Created(CreatedRange {
            from: None,
            to: Some(Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap()),
        }))
        .await?;
    assert_eq!(before_feb.len(), 1);
    assert_eq!(before_feb[0].id, dead[0]);

    let by_id = store
        .dead_letter_summaries(&DeadLetterFilter::Ids(vec![dead[1], 9999]))
        .await?;
    assert_eq!(by_id.iter().map(|s| s.id).collect::<Vec<_>>(), vec![dead[1]]);

    // A fresh active job claims the February key
    store
        .enqueue(
            NewJob::new("watchlist", json!({})).idempotency_key(format!("k-{}", feb)),
            feb,
        )
        .await?;

    let now = Utc::now();
    assert_eq!(store.requeue_dead_letter(dead[0], now).await?, RequeueOutcome::Requeued);
    assert_eq!(store.requeue_dead_letter(dead[0], now).await?, RequeueOutcome::AlreadyQueued);
    assert_eq!(
        store.requeue_dead_letter(dead[1], now).await?,
        RequeueOutcome::DuplicateActive
    );
    assert_eq!(store.requeue_dead_letter(9999, now).await?, RequeueOutcome::NotFound);

    let requeued = store.get_job(dead[0]).await?.expect("job exists");
    assert_eq!(requeued.status, JobStatus::Pending);
    assert_eq!(requeued.attempts, 1);

    // Only dead-letter rows are deleted
    assert_eq!(store.delete_dead_letters(&dead).await?, 1);
    assert!(store.get_job(dead[1]).await?.is_none());
    assert!(store.get_job(dead[0]).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_dead_letter_page_orders_and_counts_in_sql() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let store = open(&dir).await?;
    let base = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();

    let mut dead = Vec::new();
    for day in 0..7 {
        let when = base + Duration::days(day);
        let id = store.enqueue(NewJob::new("watchlist", json!({ "day": day })), when).await?;
        store.lease("watchlist", 1, "w", vt(), when).await?;
        store.dead_letter(id, "w", "http 502", when).await?;
        dead.push(id);
    }
    // A live job never shows up in the dead-letter page
    store.enqueue(NewJob::new("watchlist", json!({})), base).await?;

    let (page, total) = store
        .dead_letter_page(CreatedRange::default(), OrderBy::CreatedAt, OrderDir::Desc, 3, 0)
        .await?;
    assert_eq!(total, 7);
    assert_eq!(
        page.iter().map(|j| j.id).collect::<Vec<_>>(),
        vec![dead[6], dead[5], dead[4]]
    );
    assert_eq!(page[0].payload, json!({ "day": 6 }));

    let (page, total) = store
        .dead_letter_page(CreatedRange::default(), OrderBy::CreatedAt, OrderDir::Asc, 3, 6)
        .await?;
    assert_eq!(total, 7);
    assert_eq!(page.iter().map(|j| j.id).collect::<Vec<_>>(), vec![dead[6]]);

    let window = CreatedRange {
        from: Some(base + Duration::days(2)),
        to: Some(base + Duration::days(4)),
    };
    let (page, total) = store
        .dead_letter_page(window, OrderBy::UpdatedAt, OrderDir::Asc, 10, 0)
        .await?;
    assert_eq!(total, 2);
    assert_eq!(page.iter().map(|j| j.id).collect::<Vec<_>>(), vec![dead[2], dead[3]]);

    let mut fetched = store.dead_letters_by_ids(&[dead[1], dead[0], 9999]).await?;
    fetched.sort_by_key(|j| j.id);
    assert_eq!(fetched.iter().map(|j| j.id).collect::<Vec<_>>(), vec![dead[0], dead[1]]);
    Ok(())
}
