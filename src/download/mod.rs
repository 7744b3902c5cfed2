//! Batch image downloading: fan an annotation file's records across a
//! bounded worker pool, then reconcile the file in one atomic write.
//!
//! Workers never touch the shared store. They return per-record outcome
//! reports, and the coordinator performs the single-threaded aggregation
//! and write-back after the whole batch resolves, so a run can never leave
//! an annotation file referencing images that do not exist yet.

pub mod image_worker;

pub use image_worker::{FailureReason, ImageWorker, WorkerReport, WorkerResult};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use indicatif::ProgressBar;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::annotations::{AnnotationFile, StoreError};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("download batch interrupted; annotation file left untouched")]
    Interrupted,
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Batch totals reported after a run.
#[derive(Debug, Default, Clone)]
pub struct DownloadStats {
    pub total: usize,
    pub downloaded: usize,
    /// Records whose image already existed on disk.
    pub skipped: usize,
    pub failed: usize,
    /// Failed records removed from the file (`--update-annotations`).
    pub dropped: usize,
}

pub struct DownloadCoordinator {
    worker: Arc<ImageWorker>,
    workers: usize,
    update_annotations: bool,
    cancel: Arc<AtomicBool>,
}

impl DownloadCoordinator {
    pub fn new(worker: Arc<ImageWorker>, workers: usize, update_annotations: bool) -> Self {
        Self {
            worker,
            workers: workers.max(1),
            update_annotations,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancellation handle. Once set, no new work is spawned, in-flight
    /// fetches are allowed to finish or time out, and the batch write is
    /// abandoned.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Run the batch against the annotation file at `annotations_path`,
    /// rewriting it atomically once every record has resolved.
    ///
    /// Idempotent: records whose image file is already on disk are trusted
    /// by path existence and not re-fetched.
    pub async fn run(&self, annotations_path: &Path) -> CoordinatorResult<DownloadStats> {
        let mut file = AnnotationFile::load(annotations_path)?;
        let mut stats = DownloadStats {
            total: file.annotations.len(),
            ..DownloadStats::default()
        };

        let mut pending: Vec<usize> = Vec::new();
        for (index, record) in file.annotations.iter_mut().enumerate() {
            let path = self.worker.image_path(record);
            if path.exists() {
                record.image_path = Some(path.to_string_lossy().into_owned());
                stats.skipped += 1;
            } else {
                pending.push(index);
            }
        }
        info!(
            total = stats.total,
            pending = pending.len(),
            skipped = stats.skipped,
            workers = self.workers,
            "starting download batch"
        );

        let bar = ProgressBar::new(pending.len() as u64);
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks: JoinSet<(usize, WorkerReport)> = JoinSet::new();

        for index in pending {
            if self.cancel.load(Ordering::SeqCst) {
                break;
            }

            let permit = semaphore.clone().acquire_owned().await.unwrap();
            let worker = self.worker.clone();
            let record = file.annotations[index].clone();
            let bar = bar.clone();

            tasks.spawn(async move {
                let report = worker.process(&record).await;
                bar.inc(1);
                drop(permit);
                (index, report)
            });
        }

        let mut reports: HashMap<usize, WorkerReport> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, report)) => {
                    reports.insert(index, report);
                }
                Err(e) => warn!(error = %e, "download task panicked"),
            }
        }
        bar.finish_and_clear();

        if self.cancel.load(Ordering::SeqCst) {
            warn!("interrupted: abandoning batch write");
            return Err(CoordinatorError::Interrupted);
        }

        // Single-threaded reconcile, stable with respect to input order.
        let mut kept = Vec::with_capacity(file.annotations.len());
        for (index, mut record) in file.annotations.into_iter().enumerate() {
            match reports.get(&index) {
                Some(report) => match &report.result {
                    WorkerResult::Success { image_path } => {
                        record.image_path = Some(image_path.to_string_lossy().into_owned());
                        stats.downloaded += 1;
                        kept.push(record);
                    }
                    WorkerResult::Failure { reason } => {
                        stats.failed += 1;
                        warn!(id = %record.id, %reason, "image download failed");
                        if self.update_annotations {
                            stats.dropped += 1;
                        } else {
                            record.image_path = None;
                            kept.push(record);
                        }
                    }
                },
                // Skipped during the pre-pass; image_path already attached.
                None => kept.push(record),
            }
        }
        file.annotations = kept;
        file.save(annotations_path)?;

        info!(
            downloaded = stats.downloaded,
            skipped = stats.skipped,
            failed = stats.failed,
            dropped = stats.dropped,
            "download batch complete"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::{AnnotationInfo, AnnotationRecord};
    use crate::config::{HostPolicies, HostPolicy};
    use crate::net::{Fetcher, RateLimiter};
    use chrono::NaiveDate;
    use httpmock::prelude::*;
    use image::{DynamicImage, ImageFormat};
    use reqwest::Client;
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::time::Duration;

    fn fast_fetcher() -> Arc<Fetcher> {
        let policy = HostPolicy {
            min_interval_ms: 1,
            backoff_ceiling_secs: 1,
            max_retries: 2,
        };
        let policies = HostPolicies {
            reddit: policy.clone(),
            imgur: policy.clone(),
            generic: policy,
        };
        let limiter = Arc::new(RateLimiter::new(policies));
        Arc::new(
            Fetcher::new(Client::new(), limiter).with_retry_base(Duration::from_millis(1)),
        )
    }

    fn png_bytes() -> Vec<u8> {
        let image = DynamicImage::new_rgb8(8, 8);
        let mut buffer = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .expect("encode png");
        buffer
    }

    fn record(id: &str, url: &str) -> AnnotationRecord {
        AnnotationRecord {
            id: id.to_string(),
            subreddit: "roses".to_string(),
            author: "gardener".to_string(),
            created_utc: 1_610_000_000,
            caption: format!("caption {id}"),
            raw_caption: None,
            score: Some(10),
            permalink: None,
            url: url.to_string(),
            image_path: None,
        }
    }

    fn write_annotations(path: &Path, records: Vec<AnnotationRecord>) {
        let file = AnnotationFile {
            info: AnnotationInfo::new(
                "roses",
                NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2021, 1, 31).unwrap(),
            ),
            annotations: records,
        };
        file.save(path).expect("save annotations");
    }

    fn coordinator(images_dir: PathBuf, update_annotations: bool) -> DownloadCoordinator {
        let worker = Arc::new(ImageWorker::new(fast_fetcher(), images_dir, -1, None));
        DownloadCoordinator::new(worker, 4, update_annotations)
    }

    #[tokio::test]
    async fn attaches_image_paths_in_input_order() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET);
            then.status(200).body(png_bytes());
        });

        let dir = tempfile::tempdir().expect("tempdir");
        let annotations_path = dir.path().join("roses.json");
        write_annotations(
            &annotations_path,
            vec![
                record("aaa", &server.url("/aaa.png")),
                record("bbb", &server.url("/bbb.png")),
                record("ccc", &server.url("/ccc.png")),
            ],
        );

        let coordinator = coordinator(dir.path().join("images"), false);
        let stats = coordinator.run(&annotations_path).await.expect("run");

        assert_eq!(stats.downloaded, 3);
        let reloaded = AnnotationFile::load(&annotations_path).expect("reload");
        let ids: Vec<&str> = reloaded.annotations.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["aaa", "bbb", "ccc"]);
        for record in &reloaded.annotations {
            let path = record.image_path.as_ref().expect("image path attached");
            assert!(Path::new(path).exists());
        }
    }

    #[tokio::test]
    async fn rerun_skips_existing_images() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(GET);
            then.status(200).body(png_bytes());
        });

        let dir = tempfile::tempdir().expect("tempdir");
        let annotations_path = dir.path().join("roses.json");
        write_annotations(
            &annotations_path,
            vec![
                record("aaa", &server.url("/aaa.png")),
                record("bbb", &server.url("/bbb.png")),
            ],
        );

        let images_dir = dir.path().join("images");
        let first = coordinator(images_dir.clone(), false);
        first.run(&annotations_path).await.expect("first run");
        mock.assert_hits(2);
        let after_first = AnnotationFile::load(&annotations_path).expect("reload");

        let second = coordinator(images_dir, false);
        let stats = second.run(&annotations_path).await.expect("second run");

        // No re-downloads, no lost records, identical file.
        mock.assert_hits(2);
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.downloaded, 0);
        let after_second = AnnotationFile::load(&annotations_path).expect("reload");
        assert_eq!(after_second, after_first);
    }

    #[tokio::test]
    async fn update_annotations_drops_failed_records() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path_includes("good");
            then.status(200).body(png_bytes());
        });
        server.mock(|when, then| {
            when.method(GET).path_includes("dead");
            then.status(404);
        });

        let dir = tempfile::tempdir().expect("tempdir");
        let annotations_path = dir.path().join("roses.json");
        write_annotations(
            &annotations_path,
            vec![
                record("good1", &server.url("/good1.png")),
                record("dead1", &server.url("/dead1.png")),
                record("good2", &server.url("/good2.png")),
                record("dead2", &server.url("/dead2.png")),
                record("dead3", &server.url("/dead3.png")),
                record("good3", &server.url("/good3.png")),
                record("good4", &server.url("/good4.png")),
                record("good5", &server.url("/good5.png")),
                record("good6", &server.url("/good6.png")),
                record("good7", &server.url("/good7.png")),
            ],
        );

        let coordinator = coordinator(dir.path().join("images"), true);
        let stats = coordinator.run(&annotations_path).await.expect("run");

        assert_eq!(stats.downloaded, 7);
        assert_eq!(stats.dropped, 3);

        let reloaded = AnnotationFile::load(&annotations_path).expect("reload");
        assert_eq!(reloaded.annotations.len(), 7);
        for record in &reloaded.annotations {
            assert!(record.id.starts_with("good"));
            let path = record.image_path.as_ref().expect("image path");
            assert!(Path::new(path).exists());
        }

        // A blocklisted caption among the survivors shrinks the file further.
        let words = crate::filter::WordFilter::new(["good3".to_string()]);
        let outcome = crate::filter::run_stage(&annotations_path, &dir.path().join("images"), &words)
            .await
            .expect("word sweep");
        assert_eq!(outcome.removed, 1);

        let filtered = AnnotationFile::load(&annotations_path).expect("reload");
        assert_eq!(filtered.annotations.len(), 6);
        assert!(filtered.annotations.iter().all(|r| r.id != "good3"));
        assert!(!dir.path().join("images").join("roses").join("good3.jpg").exists());
    }

    #[tokio::test]
    async fn without_update_annotations_failures_stay_imageless() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path_includes("dead");
            then.status(404);
        });

        let dir = tempfile::tempdir().expect("tempdir");
        let annotations_path = dir.path().join("roses.json");
        write_annotations(&annotations_path, vec![record("dead1", &server.url("/dead1.png"))]);

        let coordinator = coordinator(dir.path().join("images"), false);
        let stats = coordinator.run(&annotations_path).await.expect("run");

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.dropped, 0);
        let reloaded = AnnotationFile::load(&annotations_path).expect("reload");
        assert_eq!(reloaded.annotations.len(), 1);
        assert!(reloaded.annotations[0].image_path.is_none());
    }

    #[tokio::test]
    async fn cancellation_abandons_the_batch_write() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET);
            then.status(200).body(png_bytes());
        });

        let dir = tempfile::tempdir().expect("tempdir");
        let annotations_path = dir.path().join("roses.json");
        write_annotations(&annotations_path, vec![record("aaa", &server.url("/aaa.png"))]);
        let before = std::fs::read_to_string(&annotations_path).expect("read");

        let coordinator = coordinator(dir.path().join("images"), true);
        coordinator.cancel_flag().store(true, Ordering::SeqCst);

        let result = coordinator.run(&annotations_path).await;
        assert!(matches!(result, Err(CoordinatorError::Interrupted)));

        // The file is byte-identical: no partial write happened.
        let after = std::fs::read_to_string(&annotations_path).expect("read");
        assert_eq!(after, before);
    }
}
