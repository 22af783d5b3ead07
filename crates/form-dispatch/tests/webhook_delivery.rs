use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use form_dispatch::config::ProcessingMode;
use form_dispatch::workflows::fulfillment::{
    webhook_router, ApplicantMessage, ApplicationRecord, BatchId, BatchQueue, BatchStatus,
    BatchStore, DocumentStamper, DocumentStore, FulfillmentPipeline, Notifier, NotifyError,
    QrCodeSource, SerialFileNames, StampError, StepOutcome, StoreError, Submission, TrackerError,
    TrackerGateway, WebhookState,
};
use image::{ImageFormat, Rgb, RgbImage};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use serde_json::{json, Value};
use tower::ServiceExt;

const API_KEY: &str = "integration-key";

#[derive(Debug)]
struct PngQrSource;

#[async_trait]
impl QrCodeSource for PngQrSource {
    async fn fetch(&self, _url: &str) -> Result<Vec<u8>, StampError> {
        let mut bytes = Cursor::new(Vec::new());
        RgbImage::from_pixel(4, 4, Rgb([10, 10, 10]))
            .write_to(&mut bytes, ImageFormat::Png)
            .expect("png encodes");
        Ok(bytes.into_inner())
    }
}

#[derive(Debug, Default)]
struct FolderStore;

#[async_trait]
impl DocumentStore for FolderStore {
    async fn publish(&self, _path: &Path, remote_name: &str) -> Result<String, StoreError> {
        Ok(format!("https://drive.test/{remote_name}"))
    }
}

/// Rejects one record id the way Airtable answers an unknown row.
#[derive(Debug)]
struct PickyTracker {
    rejected: &'static str,
    accepted: Mutex<Vec<String>>,
}

#[async_trait]
impl TrackerGateway for PickyTracker {
    async fn mark_shared(&self, record_id: &str, _link: &str) -> Result<(), TrackerError> {
        if record_id == self.rejected {
            return Err(TrackerError::Rejected {
                record_id: record_id.to_string(),
                status: 404,
                body: "{\"error\":\"NOT_FOUND\"}".to_string(),
            });
        }
        self.accepted
            .lock()
            .expect("tracker mutex")
            .push(record_id.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Outbox {
    messages: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Notifier for Outbox {
    async fn send(&self, message: ApplicantMessage) -> Result<(), NotifyError> {
        let csv = std::fs::read_to_string(&message.summary_csv).map_err(|source| {
            NotifyError::Attachment {
                path: message.summary_csv.clone(),
                source,
            }
        })?;
        assert!(message.merged_pdf.exists(), "merged pdf attached");
        self.messages
            .lock()
            .expect("outbox mutex")
            .push((message.recipient, csv));
        Ok(())
    }
}

fn write_template(dir: &Path) -> PathBuf {
    let mut document = Document::with_version("1.5");
    let pages_id = document.new_object_id();
    let content = Content {
        operations: vec![
            Operation::new("BT", vec![]),
            Operation::new("ET", vec![]),
        ],
    };
    let content_id = document.add_object(Stream::new(
        dictionary! {},
        content.encode().expect("content encodes"),
    ));
    let page_id = document.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
    });
    document.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        }),
    );
    let catalog_id = document.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    document.trailer.set("Root", catalog_id);
    let path = dir.join("template.pdf");
    document.save(&path).expect("template saves");
    path
}

struct Fixture {
    pipeline: Arc<FulfillmentPipeline>,
    tracker: Arc<PickyTracker>,
    outbox: Arc<Outbox>,
    queue_dir: PathBuf,
}

fn fixture(dir: &Path) -> Fixture {
    let names = SerialFileNames::new("Hatua_Application_").expect("valid prefix");
    let stamper = DocumentStamper::new(write_template(dir), names, Box::new(PngQrSource));
    let tracker = Arc::new(PickyTracker {
        rejected: "recMissing",
        accepted: Mutex::new(Vec::new()),
    });
    let outbox = Arc::new(Outbox::default());
    let pipeline = Arc::new(FulfillmentPipeline::new(
        stamper,
        Arc::new(FolderStore),
        tracker.clone(),
        outbox.clone(),
        dir.join("work"),
    ));
    Fixture {
        pipeline,
        tracker,
        outbox,
        queue_dir: dir.join("queue"),
    }
}

async fn read_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("router responds");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body reads");
    (status, serde_json::from_slice(&bytes).expect("json body"))
}

fn authorized(request: axum::http::request::Builder) -> axum::http::request::Builder {
    request.header("authorization", format!("Bearer {API_KEY}"))
}

#[tokio::test]
async fn deferred_delivery_is_processed_and_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fixture = fixture(dir.path());
    let store = BatchStore::open(&fixture.queue_dir).expect("store opens");
    let (queue, _worker) = BatchQueue::spawn(store, fixture.pipeline.clone()).expect("spawns");
    let app = webhook_router(WebhookState::new(API_KEY, queue, ProcessingMode::Deferred));

    let payload = json!({
        "records": [
            { "email": "amina@example.com", "serialNumber": "12", "qrCodeUrl": "https://qr.test/12", "recordId": "rec12" },
            { "email": "baraka@example.com", "phoneNumber": 254711000111u64, "serialNumber": 3, "qrCodeUrl": "https://qr.test/3", "recordId": "recMissing" },
            { "serialNumber": "99", "qrCodeUrl": "https://qr.test/99", "recordId": "rec99" },
            { "email": "amina@example.com", "serialNumber": "4", "qrCodeUrl": "https://qr.test/4", "recordId": "rec4" }
        ]
    });
    let (status, accepted) = read_json(
        &app,
        authorized(Request::post("/webhook"))
            .body(Body::from(payload.to_string()))
            .expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let batch_id = accepted["batchId"].as_str().expect("batch id").to_string();

    let mut settled = Value::Null;
    for _ in 0..200 {
        let (status, body) = read_json(
            &app,
            authorized(Request::get(format!("/webhook/batches/{batch_id}")))
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        if body["status"]["state"] == "completed" {
            settled = body;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_ne!(settled, Value::Null, "batch did not complete");

    let report = &settled["report"];
    assert_eq!(report["records_received"], 4);
    assert_eq!(report["records_without_email"], 1);
    assert_eq!(report["groups"][0]["email"], "amina@example.com");
    assert_eq!(report["groups"][0]["merged_pages"], 2);
    assert_eq!(report["groups"][1]["phone_number"], "254711000111");
    assert_eq!(
        report["groups"][1]["records"][0]["tracker"]["outcome"],
        "failed"
    );

    let mut accepted_ids = fixture.tracker.accepted.lock().expect("tracker mutex").clone();
    accepted_ids.sort();
    assert_eq!(accepted_ids, vec!["rec12", "rec4"]);

    let messages = fixture.outbox.messages.lock().expect("outbox mutex").clone();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].0, "amina@example.com");
    assert_eq!(
        messages[0].1,
        "Serial Number,Google Drive Link\n\
         '4,https://drive.test/Hatua_Application_4.pdf\n\
         '12,https://drive.test/Hatua_Application_12.pdf\n"
    );
}

#[tokio::test]
async fn accepted_batches_survive_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fixture = fixture(dir.path());

    let records = vec![ApplicationRecord {
        email: Some("chebet@example.com".to_string()),
        phone_number: None,
        serial_number: Some("8".to_string()),
        qr_code_url: Some("https://qr.test/8".to_string()),
        record_id: Some("rec8".to_string()),
    }];

    // Accepted but never run, as if the process died right after acknowledging.
    let batch_id: BatchId = {
        let store = BatchStore::open(&fixture.queue_dir).expect("store opens");
        let queue = BatchQueue::detached(store, fixture.pipeline.clone());
        match queue.accept("delivery-8", records.clone()).expect("accepts") {
            Submission::Enqueued(batch_id) => batch_id,
            other => panic!("expected a new batch, got {other:?}"),
        }
    };

    let store = BatchStore::open(&fixture.queue_dir).expect("store reopens");
    let (queue, _worker) = BatchQueue::spawn(store, fixture.pipeline.clone()).expect("spawns");

    let mut record = None;
    for _ in 0..200 {
        let current = queue.status(&batch_id).expect("status").expect("batch kept");
        if current.status == BatchStatus::Completed {
            record = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let record = record.expect("recovered batch completes");
    let report = record.report.expect("report stored");
    assert_eq!(report.groups[0].phone_number, "Not provided");
    assert_eq!(report.groups[0].notification, StepOutcome::Succeeded);

    assert_eq!(
        queue.submit("delivery-8", records).expect("submits"),
        Submission::Duplicate(batch_id)
    );
    assert_eq!(fixture.outbox.messages.lock().expect("outbox mutex").len(), 1);
}
