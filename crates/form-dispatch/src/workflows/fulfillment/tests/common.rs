use std::collections::HashSet;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};

use crate::workflows::fulfillment::{
    ApplicantMessage, ApplicationRecord, DocumentStamper, DocumentStore, FulfillmentPipeline,
    Notifier, NotifyError, QrCodeSource, SerialFileNames, StampError, StoreError, TrackerError,
    TrackerGateway,
};

pub(super) const PREFIX: &str = "Hatua_Application_";
pub(super) const BROKEN_QR: &str = "https://qr.test/broken";

pub(super) fn record(email: &str, serial: &str, record_id: Option<&str>) -> ApplicationRecord {
    ApplicationRecord {
        email: Some(email.to_string()),
        phone_number: Some("0711 000 000".to_string()),
        serial_number: Some(serial.to_string()),
        qr_code_url: Some(format!("https://qr.test/{serial}")),
        record_id: record_id.map(str::to_string),
    }
}

/// One-page A4 template with a line of text and inherited resources.
pub(super) fn write_template(dir: &Path) -> PathBuf {
    let mut document = Document::with_version("1.5");
    let pages_id = document.new_object_id();
    let font_id = document.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = document.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });
    let content = Content {
        operations: vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 18.into()]),
            Operation::new("Td", vec![72.into(), 760.into()]),
            Operation::new("Tj", vec![Object::string_literal("Application form")]),
            Operation::new("ET", vec![]),
        ],
    };
    let content_id = document.add_object(Stream::new(
        dictionary! {},
        content.encode().expect("template content encodes"),
    ));
    let page_id = document.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
    });
    document.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
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

pub(super) fn qr_png() -> Vec<u8> {
    let image = RgbImage::from_pixel(8, 8, Rgb([0, 0, 0]));
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, ImageFormat::Png)
        .expect("png encodes");
    bytes.into_inner()
}

/// Serves a PNG for every URL except [`BROKEN_QR`].
#[derive(Debug, Default)]
pub(super) struct StaticQrSource;

#[async_trait]
impl QrCodeSource for StaticQrSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, StampError> {
        if url == BROKEN_QR {
            return Err(StampError::QrFetch {
                url: url.to_string(),
                reason: "HTTP 404 Not Found".to_string(),
            });
        }
        Ok(qr_png())
    }
}

#[derive(Debug, Default)]
pub(super) struct MemoryStore {
    pub(super) failing: HashSet<String>,
    pub(super) uploads: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub(super) fn failing_for(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|name| name.to_string()).collect(),
            uploads: Mutex::default(),
        }
    }

    pub(super) fn uploads(&self) -> Vec<String> {
        self.uploads.lock().expect("store mutex poisoned").clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn publish(&self, path: &Path, remote_name: &str) -> Result<String, StoreError> {
        assert!(path.exists(), "uploaded file must exist");
        if self.failing.contains(remote_name) {
            return Err(StoreError::Backend("quota exceeded".to_string()));
        }
        self.uploads
            .lock()
            .expect("store mutex poisoned")
            .push(remote_name.to_string());
        Ok(format!("https://drive.test/{remote_name}"))
    }
}

#[derive(Debug, Default)]
pub(super) struct MemoryTracker {
    pub(super) updates: Mutex<Vec<(String, String)>>,
}

impl MemoryTracker {
    pub(super) fn updates(&self) -> Vec<(String, String)> {
        self.updates.lock().expect("tracker mutex poisoned").clone()
    }
}

#[async_trait]
impl TrackerGateway for MemoryTracker {
    async fn mark_shared(&self, record_id: &str, link: &str) -> Result<(), TrackerError> {
        self.updates
            .lock()
            .expect("tracker mutex poisoned")
            .push((record_id.to_string(), link.to_string()));
        Ok(())
    }
}

/// What a notifier saw; attachments are read at send time because the
/// batch workspace is gone once the pipeline returns.
#[derive(Debug, Clone)]
pub(super) struct SentMessage {
    pub(super) recipient: String,
    pub(super) phone_number: String,
    pub(super) merged_pdf: Vec<u8>,
    pub(super) summary_csv: String,
    pub(super) merged_path: PathBuf,
}

#[derive(Debug, Default)]
pub(super) struct CapturingNotifier {
    pub(super) sent: Mutex<Vec<SentMessage>>,
    delay: Option<Duration>,
    panic_for: Option<String>,
}

impl CapturingNotifier {
    /// Holds every send for `delay` before recording it.
    pub(super) fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Panics when asked to mail `recipient`.
    pub(super) fn panicking_for(recipient: &str) -> Self {
        Self {
            panic_for: Some(recipient.to_string()),
            ..Self::default()
        }
    }

    pub(super) fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().expect("notifier mutex poisoned").clone()
    }
}

#[async_trait]
impl Notifier for CapturingNotifier {
    async fn send(&self, message: ApplicantMessage) -> Result<(), NotifyError> {
        if self.panic_for.as_deref() == Some(message.recipient.as_str()) {
            panic!("mail relay crashed for {}", message.recipient);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let merged_pdf =
            std::fs::read(&message.merged_pdf).map_err(|source| NotifyError::Attachment {
                path: message.merged_pdf.clone(),
                source,
            })?;
        let summary_csv = std::fs::read_to_string(&message.summary_csv).map_err(|source| {
            NotifyError::Attachment {
                path: message.summary_csv.clone(),
                source,
            }
        })?;
        self.sent
            .lock()
            .expect("notifier mutex poisoned")
            .push(SentMessage {
                recipient: message.recipient,
                phone_number: message.phone_number,
                merged_pdf,
                summary_csv,
                merged_path: message.merged_pdf,
            });
        Ok(())
    }
}

pub(super) struct Harness {
    pub(super) pipeline: Arc<FulfillmentPipeline>,
    pub(super) store: Arc<MemoryStore>,
    pub(super) tracker: Arc<MemoryTracker>,
    pub(super) notifier: Arc<CapturingNotifier>,
    pub(super) work_root: PathBuf,
}

pub(super) fn harness(dir: &Path) -> Harness {
    harness_with_store(dir, MemoryStore::default())
}

pub(super) fn harness_with_store(dir: &Path, store: MemoryStore) -> Harness {
    harness_with(dir, store, CapturingNotifier::default())
}

pub(super) fn harness_with(dir: &Path, store: MemoryStore, notifier: CapturingNotifier) -> Harness {
    let template = write_template(dir);
    let names = SerialFileNames::new(PREFIX).expect("valid prefix");
    let stamper = DocumentStamper::new(template, names, Box::new(StaticQrSource));
    let store = Arc::new(store);
    let tracker = Arc::new(MemoryTracker::default());
    let notifier = Arc::new(notifier);
    let work_root = dir.join("work");
    let pipeline = Arc::new(FulfillmentPipeline::new(
        stamper,
        store.clone(),
        tracker.clone(),
        notifier.clone(),
        work_root.clone(),
    ));
    Harness {
        pipeline,
        store,
        tracker,
        notifier,
        work_root,
    }
}

/// Serial drawn on each page of a merged document, in page order.
pub(super) fn stamped_serials(pdf: &[u8]) -> Vec<String> {
    let document = Document::load_mem(pdf).expect("merged pdf loads");
    document
        .get_pages()
        .into_values()
        .map(|page_id| {
            let content = document
                .get_page_content(page_id)
                .expect("page content decodes");
            let operations = Content::decode(&content)
                .expect("content parses")
                .operations;
            operations
                .iter()
                .filter(|op| op.operator == "Tj")
                .filter_map(|op| op.operands.first())
                .filter_map(|operand| operand.as_str().ok())
                .map(|text| String::from_utf8_lossy(text).into_owned())
                .find(|text| text != "Application form")
                .unwrap_or_default()
        })
        .collect()
}
