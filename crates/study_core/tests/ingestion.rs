//! Drain behaviour of the material ingestion orchestrator over in-memory ports.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::Utc;
use common::Harness;
use study_core::domain::{Material, MaterialStatus};
use study_core::extraction::{ExtractionError, Extractor};
use study_core::ingestion::{IngestionConfig, IngestionService};
use study_core::memory::ScriptedOcr;
use study_core::ports::{MaterialStore, PortError};
use study_core::worker::{IngestionWorker, WorkerConfig};
use study_core::ServiceError;
use uuid::Uuid;

#[tokio::test]
async fn kick_extracts_text_pdf_and_image() {
    let h = Harness::builder()
        .ocr(ScriptedOcr::new().then(Ok("  Photosynthesis: light + CO2  ".to_string())))
        .build();
    let text = h.upload("notes.txt", "text/plain", "Chapter 1\nCells".as_bytes()).await;
    let pdf = h.upload("slides.pdf", "application/pdf", b"Slide text layer").await;
    let image = h.upload("board.png", "image/png", &[0x89, 0x50, 0x4e, 0x47]).await;

    let report = h.ingestion.kick(h.user_id, h.plan_id).await.unwrap();

    assert!(report.ok);
    assert_eq!(report.processed_count, 3);
    assert_eq!(report.failed_count, 0);
    assert_eq!(h.materials.get(text).unwrap().extracted_text.as_deref(), Some("Chapter 1\nCells"));
    assert_eq!(h.materials.get(pdf).unwrap().extracted_text.as_deref(), Some("Slide text layer"));
    assert_eq!(
        h.materials.get(image).unwrap().extracted_text.as_deref(),
        Some("Photosynthesis: light + CO2")
    );

    let status = h.ingestion.status(h.user_id, h.plan_id).await.unwrap();
    assert_eq!(status.total, 3);
    assert_eq!(status.processed, 3);
    assert!(status.settled());
}

#[tokio::test]
async fn second_kick_leaves_terminal_items_alone() {
    let h = Harness::builder().build();
    let good = h.upload("a.txt", "text/plain", b"alpha").await;
    let missing = h.register_missing("gone.txt", "text/plain").await;

    let first = h.ingestion.kick(h.user_id, h.plan_id).await.unwrap();
    assert_eq!(first.processed_count, 1);
    assert_eq!(first.failed_count, 1);
    let good_before = h.materials.get(good).unwrap();
    let missing_before = h.materials.get(missing).unwrap();

    let second = h.ingestion.kick(h.user_id, h.plan_id).await.unwrap();

    assert_eq!(second.processed_count, 0);
    assert!(second.items.is_empty());
    let good_after = h.materials.get(good).unwrap();
    let missing_after = h.materials.get(missing).unwrap();
    assert_eq!(good_after.updated_at, good_before.updated_at);
    assert_eq!(missing_after.updated_at, missing_before.updated_at);
    assert_eq!(missing_after.status, MaterialStatus::Failed);
}

#[tokio::test]
async fn empty_ocr_result_still_counts_as_processed() {
    let h = Harness::builder().build();
    let image = h.upload("blank.jpg", "image/jpeg", &[0xff, 0xd8, 0xff]).await;

    let report = h.ingestion.kick(h.user_id, h.plan_id).await.unwrap();

    assert_eq!(report.processed_count, 1);
    let material = h.materials.get(image).unwrap();
    assert_eq!(material.status, MaterialStatus::Processed);
    assert_eq!(material.extracted_text, None);
    assert_eq!(material.last_error, None);
}

#[tokio::test]
async fn transient_ocr_error_is_retried_inside_extraction() {
    let h = Harness::builder()
        .ocr(
            ScriptedOcr::new()
                .then(Err(PortError::Upstream { status: 503, message: "overloaded".to_string() }))
                .then(Ok("Recovered text".to_string())),
        )
        .build();
    let image = h.upload("scan.png", "image/png", &[1, 2, 3]).await;

    let report = h.ingestion.kick(h.user_id, h.plan_id).await.unwrap();

    assert_eq!(report.processed_count, 1);
    assert_eq!(report.items[0].attempts, 1);
    assert_eq!(h.ocr.calls(), 2);
    assert_eq!(h.materials.get(image).unwrap().extracted_text.as_deref(), Some("Recovered text"));
}

#[tokio::test]
async fn one_failing_item_does_not_affect_its_batch() {
    let h = Harness::builder().build();
    let a = h.upload("a.txt", "text/plain", b"first").await;
    let broken = h.register_missing("b.txt", "text/plain").await;
    let c = h.upload("c.txt", "text/plain", b"third").await;

    let report = h.ingestion.kick(h.user_id, h.plan_id).await.unwrap();

    assert_eq!(report.processed_count, 2);
    assert_eq!(report.failed_count, 1);
    let failed = report.items.iter().find(|i| i.material_id == broken).unwrap();
    assert_eq!(failed.status, MaterialStatus::Failed);
    assert_eq!(failed.attempts, 2);

    let broken = h.materials.get(broken).unwrap();
    assert_eq!(broken.status, MaterialStatus::Failed);
    assert!(broken.last_error.unwrap().contains("Download failed"));
    assert_eq!(h.materials.get(a).unwrap().status, MaterialStatus::Processed);
    assert_eq!(h.materials.get(c).unwrap().status, MaterialStatus::Processed);
}

#[tokio::test]
async fn invalid_utf8_text_fails_with_reason() {
    let h = Harness::builder().build();
    let id = h.upload("bad.txt", "text/plain", &[0xc3, 0x28]).await;

    h.ingestion.kick(h.user_id, h.plan_id).await.unwrap();

    let material = h.materials.get(id).unwrap();
    assert_eq!(material.status, MaterialStatus::Failed);
    assert!(material.last_error.unwrap().starts_with("Could not decode text"));
}

#[tokio::test]
async fn too_many_files_rejects_before_any_mutation() {
    let h = Harness::builder()
        .ingestion(IngestionConfig::default().with_limits(2, 6))
        .build();
    // Rows inserted behind register's back, as a second client could.
    for name in ["a.txt", "b.txt", "c.txt"] {
        let path = format!("{}/{}", h.user_id, name);
        h.materials
            .insert_material(Material::new_uploaded(h.user_id, h.plan_id, &path, "text/plain"))
            .await
            .unwrap();
    }

    let err = h.ingestion.kick(h.user_id, h.plan_id).await.unwrap_err();

    assert_matches!(err, ServiceError::TooManyFiles { count: 3, max: 2 });
    assert_eq!(err.code(), "TOO_MANY_FILES");
    let status = h.ingestion.status(h.user_id, h.plan_id).await.unwrap();
    assert!(status.items.iter().all(|i| i.status == MaterialStatus::Uploaded));
}

/// Inserts image rows straight into the store, bypassing register's limit checks.
async fn insert_images(h: &Harness, user_id: Uuid, plan_id: Uuid, count: usize) {
    for i in 0..count {
        let path = format!("{}/{}/scan-{}.png", user_id, plan_id, i);
        h.blobs.put(&path, vec![i as u8]);
        h.materials
            .insert_material(Material::new_uploaded(user_id, plan_id, &path, "image/png"))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn too_many_images_rejects_the_drain() {
    let h = Harness::builder()
        .ingestion(IngestionConfig::default().with_limits(10, 1))
        .build();
    insert_images(&h, h.user_id, h.plan_id, 2).await;

    let err = h.ingestion.kick(h.user_id, h.plan_id).await.unwrap_err();

    assert_matches!(err, ServiceError::TooManyFiles { count: 2, max: 1 });
    assert_eq!(h.ocr.calls(), 0);
}

#[tokio::test]
async fn register_enforces_the_image_limit() {
    let h = Harness::builder()
        .ingestion(IngestionConfig::default().with_limits(10, 1))
        .build();
    h.upload("first.png", "image/png", &[1]).await;

    let second = format!("{}/{}/second.png", h.user_id, h.plan_id);
    let err = h
        .ingestion
        .register(h.user_id, h.plan_id, &second, "image/png")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::TooManyFiles { count: 2, max: 1 });

    // The extension alone is enough to count as an image.
    let disguised = format!("{}/{}/photo.JPG", h.user_id, h.plan_id);
    let err = h
        .ingestion
        .register(h.user_id, h.plan_id, &disguised, "application/octet-stream")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::TooManyFiles { .. });

    // Other kinds still fit.
    h.upload("notes.txt", "text/plain", b"still room").await;
    assert_eq!(h.ingestion.status(h.user_id, h.plan_id).await.unwrap().total, 2);
}

#[tokio::test]
async fn register_enforces_user_prefix_and_file_limit() {
    let h = Harness::builder()
        .ingestion(IngestionConfig::default().with_limits(1, 1))
        .build();

    let err = h
        .ingestion
        .register(h.user_id, h.plan_id, "someone-else/file.txt", "text/plain")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidInput(_));

    let traversal = format!("{}/../other/file.txt", h.user_id);
    let err = h
        .ingestion
        .register(h.user_id, h.plan_id, &traversal, "text/plain")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidInput(_));

    h.upload("one.txt", "text/plain", b"1").await;
    let second = format!("{}/two.txt", h.user_id);
    let err = h
        .ingestion
        .register(h.user_id, h.plan_id, &second, "text/plain")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::TooManyFiles { max: 1, .. });
}

#[tokio::test]
async fn stale_processing_lease_is_reclaimed() {
    let h = Harness::builder().build();
    let stale = h.upload("stale.txt", "text/plain", b"left behind").await;
    let fresh = h.upload("fresh.txt", "text/plain", b"in flight").await;
    h.materials.set_state(
        stale,
        MaterialStatus::Processing,
        Utc::now() - chrono::Duration::minutes(20),
    );
    h.materials.set_state(fresh, MaterialStatus::Processing, Utc::now());

    let report = h.ingestion.kick(h.user_id, h.plan_id).await.unwrap();

    assert_eq!(report.processed_count, 1);
    assert_eq!(h.materials.get(stale).unwrap().status, MaterialStatus::Processed);
    assert_eq!(h.materials.get(fresh).unwrap().status, MaterialStatus::Processing);
}

#[tokio::test]
async fn failed_item_is_retried_after_cooldown() {
    let h = Harness::builder()
        .ingestion(IngestionConfig::default().with_failed_cooldown(Duration::ZERO))
        .build();
    let id = h.register_missing("late.txt", "text/plain").await;

    h.ingestion.kick(h.user_id, h.plan_id).await.unwrap();
    assert_eq!(h.materials.get(id).unwrap().status, MaterialStatus::Failed);

    let path = h.materials.get(id).unwrap().file_path;
    h.blobs.put(&path, b"arrived late".to_vec());
    let report = h.ingestion.kick(h.user_id, h.plan_id).await.unwrap();

    assert_eq!(report.processed_count, 1);
    let material = h.materials.get(id).unwrap();
    assert_eq!(material.status, MaterialStatus::Processed);
    assert_eq!(material.last_error, None);
    assert_eq!(material.extracted_text.as_deref(), Some("arrived late"));
}

#[tokio::test]
async fn text_is_clipped_to_the_cap() {
    let h = Harness::builder()
        .ingestion(IngestionConfig::default().with_text_cap(5))
        .build();
    let id = h.upload("long.txt", "text/plain", "ñandú rhea".as_bytes()).await;

    h.ingestion.kick(h.user_id, h.plan_id).await.unwrap();

    assert_eq!(h.materials.get(id).unwrap().extracted_text.as_deref(), Some("ñandú"));
}

#[tokio::test]
async fn worker_tick_drains_pending_plans() {
    let h = Harness::builder().build();
    let id = h.upload("queued.txt", "text/plain", b"queued work").await;
    let worker = IngestionWorker::new(
        h.materials.clone(),
        h.ingestion.clone(),
        WorkerConfig::default().with_interval(Duration::from_millis(10)),
    );

    assert_eq!(worker.tick().await, 1);
    assert_eq!(h.materials.get(id).unwrap().status, MaterialStatus::Processed);
    assert_eq!(worker.tick().await, 0);
}

#[tokio::test]
async fn worker_stops_on_cancellation() {
    let h = Harness::builder().build();
    let worker = IngestionWorker::new(
        h.materials.clone(),
        h.ingestion.clone(),
        WorkerConfig::default().with_interval(Duration::from_millis(10)),
    );
    let shutdown = tokio_util::sync::CancellationToken::new();
    let handle = worker.spawn(shutdown.clone());

    shutdown.cancel();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker should stop promptly")
        .unwrap();
}

#[tokio::test]
async fn worker_rotates_past_plans_over_their_limits() {
    let h = Harness::builder()
        .ingestion(IngestionConfig::default().with_limits(10, 1))
        .build();
    let config = WorkerConfig::default().with_interval(Duration::from_millis(10));
    // More blocked plans than one page holds, all older than the healthy one.
    for _ in 0..config.plans_per_tick + 1 {
        insert_images(&h, h.user_id, Uuid::new_v4(), 2).await;
    }
    let id = h.upload("queued.txt", "text/plain", b"queued behind blocked plans").await;
    let worker = IngestionWorker::new(h.materials.clone(), h.ingestion.clone(), config);

    assert_eq!(worker.tick().await, 1);
    assert_eq!(h.materials.get(id).unwrap().status, MaterialStatus::Processed);
    assert_eq!(h.ocr.calls(), 0);
    assert_eq!(worker.tick().await, 0);
}

/// Records how many extractions overlap and in which order they start.
#[derive(Default)]
struct TrackingExtractor {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    started: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl Extractor for TrackingExtractor {
    async fn extract(&self, material: &Material) -> Result<String, ExtractionError> {
        self.started.lock().unwrap().push(material.id);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(25)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(format!("text of {}", material.file_path))
    }
}

#[tokio::test]
async fn drain_runs_batches_of_two_in_creation_order() {
    let h = Harness::builder().build();
    let extractor = Arc::new(TrackingExtractor::default());
    let ingestion = IngestionService::new(h.materials.clone(), extractor.clone(), IngestionConfig::default());

    let mut ids = Vec::new();
    for i in 0..5 {
        let path = format!("{}/{}/part-{}.txt", h.user_id, h.plan_id, i);
        ids.push(ingestion.register(h.user_id, h.plan_id, &path, "text/plain").await.unwrap().id);
    }

    let report = ingestion.kick(h.user_id, h.plan_id).await.unwrap();

    assert_eq!(report.processed_count, 5);
    assert_eq!(extractor.peak.load(Ordering::SeqCst), 2);
    let started = extractor.started.lock().unwrap().clone();
    assert_eq!(started.len(), 5);
    for (batch, expected) in started.chunks(2).zip(ids.chunks(2)) {
        let mut batch = batch.to_vec();
        let mut expected = expected.to_vec();
        batch.sort();
        expected.sort();
        assert_eq!(batch, expected);
    }
    let reported: Vec<Uuid> = report.items.iter().map(|i| i.material_id).collect();
    assert_eq!(reported, ids);
}
