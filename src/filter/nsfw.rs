//! NSFW image classification stage.
//!
//! The model runtime is an external collaborator behind [`NsfwScorer`]; the
//! stage itself only compares scores against its threshold.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::annotations::{AnnotationInfo, AnnotationRecord, FilterMarker};

use super::{invoke_classifier, Decision, FilterError, FilterResult, FilterStage};

const MODEL_NAME: &str = "gantman/nsfw_model";

/// Softmax scores emitted by the NSFW model. Unlisted categories default to
/// zero so older model versions stay readable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NsfwScores {
    #[serde(default)]
    pub porn: f64,
    #[serde(default)]
    pub hentai: f64,
    #[serde(default)]
    pub sexy: f64,
    #[serde(default)]
    pub drawings: f64,
    #[serde(default)]
    pub neutral: f64,
}

impl NsfwScores {
    /// The probability mass that flags an image: explicit categories only.
    pub fn unsafe_score(&self) -> f64 {
        self.porn + self.hentai
    }
}

/// Narrow capability interface to the NSFW model runtime.
#[async_trait]
pub trait NsfwScorer: Send + Sync {
    async fn score(&self, image: &[u8]) -> FilterResult<NsfwScores>;
}

/// Scores images by running an external inference command: image bytes on
/// stdin, a JSON object of category scores on stdout.
pub struct CommandScorer {
    program: PathBuf,
    model: PathBuf,
}

impl CommandScorer {
    pub fn new(program: impl Into<PathBuf>, model: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl NsfwScorer for CommandScorer {
    async fn score(&self, image: &[u8]) -> FilterResult<NsfwScores> {
        let mut command = Command::new(&self.program);
        command.arg("--model").arg(&self.model);

        let stdout = invoke_classifier(command, image).await?;
        serde_json::from_slice(&stdout)
            .map_err(|e| FilterError::Classifier(format!("malformed NSFW scores: {e}")))
    }
}

/// Removes records whose images score above the flag threshold.
pub struct NsfwFilter {
    scorer: Box<dyn NsfwScorer>,
    threshold: f64,
}

impl NsfwFilter {
    pub fn new(scorer: Box<dyn NsfwScorer>, threshold: f64) -> Self {
        Self { scorer, threshold }
    }
}

#[async_trait]
impl FilterStage for NsfwFilter {
    fn name(&self) -> &'static str {
        "nsfw"
    }

    fn model(&self) -> String {
        MODEL_NAME.to_string()
    }

    fn threshold(&self) -> Option<f64> {
        Some(self.threshold)
    }

    fn needs_image(&self) -> bool {
        true
    }

    async fn evaluate(
        &self,
        _record: &AnnotationRecord,
        image: Option<&[u8]>,
    ) -> FilterResult<Decision> {
        let image = image
            .ok_or_else(|| FilterError::Classifier("NSFW stage requires image bytes".to_string()))?;
        let scores = self.scorer.score(image).await?;

        Ok(if scores.unsafe_score() > self.threshold {
            Decision::Reject(format!("NSFW score {:.3}", scores.unsafe_score()))
        } else {
            Decision::Accept
        })
    }

    fn marker<'a>(&self, info: &'a AnnotationInfo) -> Option<&'a FilterMarker> {
        info.nsfw_filter.as_ref()
    }

    fn set_marker(&self, info: &mut AnnotationInfo, marker: FilterMarker) {
        info.nsfw_filter = Some(marker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::AnnotationFile;
    use crate::filter::test_support::{annotation_file, record, write_image_for};
    use crate::filter::{run_stage, WordFilter};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scores every image with a fixed value and counts invocations.
    pub struct FixedScorer {
        pub porn: f64,
        pub calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NsfwScorer for FixedScorer {
        async fn score(&self, _image: &[u8]) -> FilterResult<NsfwScores> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(NsfwScores {
                porn: self.porn,
                ..NsfwScores::default()
            })
        }
    }

    struct FailingScorer;

    #[async_trait]
    impl NsfwScorer for FailingScorer {
        async fn score(&self, _image: &[u8]) -> FilterResult<NsfwScores> {
            Err(FilterError::Classifier("model load failed".to_string()))
        }
    }

    #[tokio::test]
    async fn flagged_images_are_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let annotations_path = dir.path().join("roses.json");
        let images_dir = dir.path().join("images");

        let flagged = record("bad1", "a rose");
        let image_path = write_image_for(&images_dir, &flagged);
        annotation_file(vec![flagged]).save(&annotations_path).expect("save");

        let calls = Arc::new(AtomicUsize::new(0));
        let stage = NsfwFilter::new(
            Box::new(FixedScorer {
                porn: 0.95,
                calls: calls.clone(),
            }),
            0.9,
        );

        let outcome = run_stage(&annotations_path, &images_dir, &stage).await.expect("sweep");
        assert_eq!(outcome.removed, 1);
        assert!(!image_path.exists());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let reloaded = AnnotationFile::load(&annotations_path).expect("load");
        assert!(reloaded.annotations.is_empty());
        assert!(reloaded.info.nsfw_filter.is_some());
    }

    #[tokio::test]
    async fn records_without_images_are_not_scored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let annotations_path = dir.path().join("roses.json");
        let images_dir = dir.path().join("images");

        annotation_file(vec![record("nodisk", "a rose")])
            .save(&annotations_path)
            .expect("save");

        let calls = Arc::new(AtomicUsize::new(0));
        let stage = NsfwFilter::new(
            Box::new(FixedScorer {
                porn: 0.95,
                calls: calls.clone(),
            }),
            0.9,
        );

        let outcome = run_stage(&annotations_path, &images_dir, &stage).await.expect("sweep");
        assert_eq!(outcome.removed, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let reloaded = AnnotationFile::load(&annotations_path).expect("load");
        assert_eq!(reloaded.annotations.len(), 1);
    }

    #[tokio::test]
    async fn classifier_failure_aborts_without_saving() {
        let dir = tempfile::tempdir().expect("tempdir");
        let annotations_path = dir.path().join("roses.json");
        let images_dir = dir.path().join("images");

        let record = record("aaa", "a rose");
        write_image_for(&images_dir, &record);
        annotation_file(vec![record]).save(&annotations_path).expect("save");

        let stage = NsfwFilter::new(Box::new(FailingScorer), 0.9);
        let result = run_stage(&annotations_path, &images_dir, &stage).await;
        assert!(matches!(result, Err(FilterError::Classifier(_))));

        // The file was not stamped: the failed sweep can be re-run.
        let reloaded = AnnotationFile::load(&annotations_path).expect("load");
        assert!(reloaded.info.nsfw_filter.is_none());
        assert_eq!(reloaded.annotations.len(), 1);
    }

    #[tokio::test]
    async fn word_rejected_records_never_reach_the_scorer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let annotations_path = dir.path().join("roses.json");
        let images_dir = dir.path().join("images");

        let profane = record("bad1", "a gun on the table");
        let clean = record("ok1", "a rose on the table");
        write_image_for(&images_dir, &profane);
        write_image_for(&images_dir, &clean);
        annotation_file(vec![profane, clean])
            .save(&annotations_path)
            .expect("save");

        let words = WordFilter::new(["gun".to_string()]);
        run_stage(&annotations_path, &images_dir, &words).await.expect("word sweep");

        let calls = Arc::new(AtomicUsize::new(0));
        let stage = NsfwFilter::new(
            Box::new(FixedScorer {
                porn: 0.0,
                calls: calls.clone(),
            }),
            0.9,
        );
        run_stage(&annotations_path, &images_dir, &stage).await.expect("nsfw sweep");

        // Only the surviving record was ever scored.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
