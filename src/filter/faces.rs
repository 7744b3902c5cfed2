//! Face detection stage. An image with any confident face detection is
//! removed: people who appear in photos never consented to ending up in a
//! training corpus.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::info;

use crate::annotations::{AnnotationInfo, AnnotationRecord, FilterMarker};

use super::{invoke_classifier, Decision, FilterError, FilterResult, FilterStage};

const MODEL_NAME: &str = "pytorch-retinaface (mobilenet0.25)";

/// Where the detector weights are fetched from when missing locally.
pub const MODEL_URL: &str =
    "https://github.com/biubug6/Pytorch_Retinaface/releases/download/v1.0/mobilenet0.25_Final.pth";

pub const MODEL_FILENAME: &str = "mobilenet0.25_final.pth";

/// One detected face with its confidence.
#[derive(Debug, Clone, Deserialize)]
pub struct FaceBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub confidence: f64,
}

#[derive(Debug, Deserialize)]
struct DetectOutput {
    #[serde(default)]
    boxes: Vec<FaceBox>,
}

/// Narrow capability interface to the face detector runtime.
#[async_trait]
pub trait FaceDetector: Send + Sync {
    async fn detect(&self, image: &[u8]) -> FilterResult<Vec<FaceBox>>;
}

/// Detects faces by running an external inference command: image bytes on
/// stdin, a JSON object with a `boxes` array on stdout.
pub struct CommandDetector {
    program: PathBuf,
    model: PathBuf,
}

impl CommandDetector {
    pub fn new(program: impl Into<PathBuf>, model: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl FaceDetector for CommandDetector {
    async fn detect(&self, image: &[u8]) -> FilterResult<Vec<FaceBox>> {
        let mut command = Command::new(&self.program);
        command.arg("--model").arg(&self.model);

        let stdout = invoke_classifier(command, image).await?;
        let output: DetectOutput = serde_json::from_slice(&stdout)
            .map_err(|e| FilterError::Classifier(format!("malformed detector output: {e}")))?;
        Ok(output.boxes)
    }
}

/// Fetch the detector weights into `cache_dir` if they are not already
/// there, and return their path.
pub async fn ensure_model(client: &reqwest::Client, cache_dir: &Path) -> FilterResult<PathBuf> {
    ensure_model_from(client, MODEL_URL, cache_dir).await
}

pub async fn ensure_model_from(
    client: &reqwest::Client,
    url: &str,
    cache_dir: &Path,
) -> FilterResult<PathBuf> {
    let model_path = cache_dir.join(MODEL_FILENAME);
    if model_path.exists() {
        return Ok(model_path);
    }

    info!(url, "fetching face detector weights");
    let response = client
        .get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| FilterError::Classifier(format!("cannot fetch detector weights: {e}")))?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| FilterError::Classifier(format!("cannot read detector weights: {e}")))?;

    fs::create_dir_all(cache_dir)?;
    let tmp_path = model_path.with_extension("pth.tmp");
    fs::write(&tmp_path, &bytes)?;
    fs::rename(&tmp_path, &model_path)?;

    info!(path = %model_path.display(), "face detector weights cached");
    Ok(model_path)
}

/// Removes records whose images contain any face detected above the
/// confidence threshold.
pub struct FaceFilter {
    detector: Box<dyn FaceDetector>,
    threshold: f64,
}

impl FaceFilter {
    pub fn new(detector: Box<dyn FaceDetector>, threshold: f64) -> Self {
        Self { detector, threshold }
    }
}

#[async_trait]
impl FilterStage for FaceFilter {
    fn name(&self) -> &'static str {
        "faces"
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
            .ok_or_else(|| FilterError::Classifier("face stage requires image bytes".to_string()))?;
        let boxes = self.detector.detect(image).await?;

        let confident = boxes
            .iter()
            .filter(|face| face.confidence >= self.threshold)
            .count();
        Ok(if confident > 0 {
            Decision::Reject(format!("{confident} face(s) detected"))
        } else {
            Decision::Accept
        })
    }

    fn marker<'a>(&self, info: &'a AnnotationInfo) -> Option<&'a FilterMarker> {
        info.face_filter.as_ref()
    }

    fn set_marker(&self, info: &mut AnnotationInfo, marker: FilterMarker) {
        info.face_filter = Some(marker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::AnnotationFile;
    use crate::filter::test_support::{annotation_file, record, write_image_for};
    use crate::filter::run_stage;

    struct FixedDetector {
        boxes: Vec<FaceBox>,
    }

    #[async_trait]
    impl FaceDetector for FixedDetector {
        async fn detect(&self, _image: &[u8]) -> FilterResult<Vec<FaceBox>> {
            Ok(self.boxes.clone())
        }
    }

    fn face(confidence: f64) -> FaceBox {
        FaceBox {
            x: 1.0,
            y: 2.0,
            width: 30.0,
            height: 40.0,
            confidence,
        }
    }

    #[tokio::test]
    async fn images_with_confident_faces_are_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let annotations_path = dir.path().join("roses.json");
        let images_dir = dir.path().join("images");

        let portrait = record("face1", "me with my rose");
        let image_path = write_image_for(&images_dir, &portrait);
        annotation_file(vec![portrait]).save(&annotations_path).expect("save");

        let stage = FaceFilter::new(Box::new(FixedDetector { boxes: vec![face(0.97)] }), 0.9);
        let outcome = run_stage(&annotations_path, &images_dir, &stage).await.expect("sweep");

        assert_eq!(outcome.removed, 1);
        assert!(!image_path.exists());
        let reloaded = AnnotationFile::load(&annotations_path).expect("load");
        assert!(reloaded.annotations.is_empty());
        assert!(reloaded.info.face_filter.is_some());
    }

    #[tokio::test]
    async fn low_confidence_detections_are_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let annotations_path = dir.path().join("roses.json");
        let images_dir = dir.path().join("images");

        let blurry = record("blur1", "a crowd far away");
        write_image_for(&images_dir, &blurry);
        annotation_file(vec![blurry]).save(&annotations_path).expect("save");

        let stage = FaceFilter::new(
            Box::new(FixedDetector { boxes: vec![face(0.3), face(0.5)] }),
            0.9,
        );
        let outcome = run_stage(&annotations_path, &images_dir, &stage).await.expect("sweep");

        assert_eq!(outcome.removed, 0);
        let reloaded = AnnotationFile::load(&annotations_path).expect("load");
        assert_eq!(reloaded.annotations.len(), 1);
    }

    #[tokio::test]
    async fn ensure_model_downloads_once() {
        use httpmock::prelude::*;

        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(GET).path("/weights.pth");
            then.status(200).body(b"weights");
        });

        let dir = tempfile::tempdir().expect("tempdir");
        let cache_dir = dir.path().join("models");
        let client = reqwest::Client::new();
        let url = server.url("/weights.pth");

        let path = ensure_model_from(&client, &url, &cache_dir).await.expect("download");
        assert_eq!(path, cache_dir.join(MODEL_FILENAME));
        assert_eq!(std::fs::read(&path).expect("read weights"), b"weights");

        // Second call is served from the cache.
        ensure_model_from(&client, &url, &cache_dir).await.expect("cache hit");
        mock.assert_hits(1);
    }
}
