use std::fs;

use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use intelliscan_rs::artifacts::ArtifactStore;
use intelliscan_rs::classification::{ClassIndex, ClassificationPredictor};
use intelliscan_rs::config::{ChannelOrder, ResizeFilter};
use intelliscan_rs::mocks::{
    jpeg_bytes, test_classes, MockClassificationModel, MockSegmentationModel,
};
use intelliscan_rs::patchify::{PatchEncoder, PatchGrid};
use intelliscan_rs::pipeline::MAX_IMAGE_SIDE;
use intelliscan_rs::segmentation::SegmentationPredictor;
use intelliscan_rs::{router, AppState, Config, InferencePipeline};

const BOUNDARY: &str = "intelliscan-test-boundary";
const IMAGE_SIZE: u32 = 64;

fn test_config() -> Config {
    Config {
        image_size: IMAGE_SIZE,
        patch_size: 16,
        ..Config::default()
    }
}

fn grid() -> PatchGrid {
    PatchGrid::new(IMAGE_SIZE, 16, 3).unwrap()
}

fn encoder() -> PatchEncoder {
    PatchEncoder::new(grid(), ResizeFilter::Bilinear, ChannelOrder::Bgr)
}

fn classifier() -> ClassificationPredictor<MockClassificationModel> {
    ClassificationPredictor::new(
        MockClassificationModel::new(vec![0.3, 1.7, 0.2, -0.5]),
        test_classes(),
    )
}

fn app_with(
    segmenter: SegmentationPredictor<MockSegmentationModel>,
    classifier: ClassificationPredictor<MockClassificationModel>,
    artifacts: ArtifactStore,
    config: Config,
) -> Router {
    let pipeline = InferencePipeline::new(encoder(), segmenter, classifier, artifacts);
    router(AppState::new(pipeline, config))
}

fn app() -> Router {
    app_with(
        SegmentationPredictor::new(MockSegmentationModel::gradient(), grid()),
        classifier(),
        ArtifactStore::new(8),
        test_config(),
    )
}

fn multipart_request(field: &str, payload: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{field}\"; filename=\"scan.jpg\"\r\n\
             Content-Type: image/jpeg\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(payload);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/predict")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn test_predict_then_fetch_mask() {
    let app = app();

    let response = app
        .clone()
        .oneshot(multipart_request("image", &jpeg_bytes(120, 90).unwrap()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    let classification = &json["classification"];
    assert_eq!(classification["label"], "meningioma");

    let confidence = classification["confidence"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&confidence));

    let probabilities = classification["probabilities"].as_object().unwrap();
    let names = probabilities.keys().cloned().collect::<Vec<_>>();
    assert_eq!(names, test_classes().names());
    let sum: f64 = probabilities.values().map(|p| p.as_f64().unwrap()).sum();
    assert!((sum - 1.0).abs() < 1e-3);

    let mask_url = json["segmentation_mask_url"].as_str().unwrap().to_string();
    assert!(mask_url.starts_with("/mask/"));

    let latest = app.clone().oneshot(get("/mask")).await.unwrap();
    assert_eq!(latest.status(), StatusCode::OK);
    assert_eq!(latest.headers()[header::CONTENT_TYPE], "image/png");
    let latest = body_bytes(latest).await;

    let overlay = image::load_from_memory(&latest).unwrap();
    assert_eq!((overlay.width(), overlay.height()), (IMAGE_SIZE, IMAGE_SIZE));

    let scoped = app.oneshot(get(&mask_url)).await.unwrap();
    assert_eq!(scoped.status(), StatusCode::OK);
    assert_eq!(body_bytes(scoped).await, latest);
}

#[tokio::test]
async fn test_identical_uploads_give_identical_overlays() {
    let app = app();
    let upload = jpeg_bytes(80, 80).unwrap();

    let mut overlays = Vec::new();
    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(multipart_request("image", &upload))
            .await
            .unwrap();
        let json = body_json(response).await;
        let url = json["segmentation_mask_url"].as_str().unwrap().to_string();
        let overlay = app.clone().oneshot(get(&url)).await.unwrap();
        overlays.push(body_bytes(overlay).await);
    }

    assert_eq!(overlays[0], overlays[1]);
}

#[tokio::test]
async fn test_non_image_upload_is_rejected() {
    let response = app()
        .oneshot(multipart_request("image", b"definitely not an image"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "Invalid image");
}

#[tokio::test]
async fn test_oversized_dimensions_are_an_invalid_format() {
    let wide = image::RgbImage::new(MAX_IMAGE_SIDE + 1, 1);
    let mut png = std::io::Cursor::new(Vec::new());
    wide.write_to(&mut png, image::ImageFormat::Png).unwrap();

    let response = app()
        .oneshot(multipart_request("image", png.get_ref()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "Invalid image format");
}

#[tokio::test]
async fn test_upload_over_limit_is_payload_too_large() {
    let config = Config {
        max_upload_bytes: 1024,
        ..test_config()
    };
    let app = app_with(
        SegmentationPredictor::new(MockSegmentationModel::gradient(), grid()),
        classifier(),
        ArtifactStore::new(8),
        config,
    );

    let response = app
        .oneshot(multipart_request("image", &vec![0u8; 8 * 1024]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_missing_image_field() {
    let response = app()
        .oneshot(multipart_request("file", &jpeg_bytes(16, 16).unwrap()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "No image uploaded");
}

#[tokio::test]
async fn test_mask_before_any_prediction() {
    let app = app();

    let response = app.clone().oneshot(get("/mask")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"], "mask not found");

    let response = app.oneshot(get("/mask/not-a-uuid")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_disabled_segmentation_model() {
    let app = app_with(
        SegmentationPredictor::disabled(grid()),
        classifier(),
        ArtifactStore::new(8),
        test_config(),
    );

    let response = app
        .clone()
        .oneshot(multipart_request("image", &jpeg_bytes(32, 32).unwrap()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        body_json(response).await["error"],
        "segmentation model unavailable"
    );

    let health = body_json(app.oneshot(get("/healthz")).await.unwrap()).await;
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["segmentation"], false);
    assert_eq!(health["classification"], true);
}

#[tokio::test]
async fn test_disabled_classifier_keeps_overlay() {
    let app = app_with(
        SegmentationPredictor::new(MockSegmentationModel::constant(0.9), grid()),
        ClassificationPredictor::disabled(test_classes()),
        ArtifactStore::new(8),
        test_config(),
    );

    let response = app
        .clone()
        .oneshot(multipart_request("image", &jpeg_bytes(32, 32).unwrap()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        body_json(response).await["error"],
        "classification model unavailable"
    );

    let mask = app.oneshot(get("/mask")).await.unwrap();
    assert_eq!(mask.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_healthz_lists_classes() {
    let health = body_json(app().oneshot(get("/healthz")).await.unwrap()).await;

    assert_eq!(health["status"], "ok");
    assert_eq!(
        health["classes"],
        serde_json::json!(["glioma", "meningioma", "notumor", "pituitary"])
    );
}

#[tokio::test]
async fn test_class_directory_and_mask_file() {
    let temp_dir = TempDir::new().unwrap();
    let training = temp_dir.path().join("Training");
    for (class, file) in [
        ("pituitary", "p1.png"),
        ("glioma", "g1.JPG"),
        ("notumor", "nested/n1.jpeg"),
        ("meningioma", "m1.jpg"),
    ] {
        let path = training.join(class).join(file);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"placeholder").unwrap();
    }
    let classes = ClassIndex::from_directory(&training).unwrap();
    assert_eq!(classes, test_classes());

    let mask_path = temp_dir.path().join("output_mask.png");
    let config = Config {
        public_base_url: "http://scanner.local/".to_string(),
        mask_path: Some(mask_path.clone()),
        ..test_config()
    };
    let app = app_with(
        SegmentationPredictor::new(MockSegmentationModel::gradient(), grid()),
        ClassificationPredictor::new(
            MockClassificationModel::new(vec![0.0, 0.0, 0.0, 5.0]),
            classes,
        ),
        ArtifactStore::new(8).with_mask_path(&mask_path),
        config,
    );

    let response = app
        .clone()
        .oneshot(multipart_request("image", &jpeg_bytes(50, 70).unwrap()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["classification"]["label"], "pituitary");
    let url = json["segmentation_mask_url"].as_str().unwrap();
    assert!(url.starts_with("http://scanner.local/mask/"));

    let latest = body_bytes(app.oneshot(get("/mask")).await.unwrap()).await;
    assert_eq!(fs::read(&mask_path).unwrap(), latest);
}
