//! Overlay of serial number and QR code onto the application template.

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use tracing::debug;

use super::domain::StampedDocument;
use super::naming::SerialFileNames;

const FONT_RESOURCE: &str = "FDStampFont";
const QR_RESOURCE: &str = "FDStampQr";
const INHERITABLE_DEPTH: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum StampError {
    #[error("record has no serial number")]
    MissingSerial,
    #[error("record has no QR code URL")]
    MissingQrCode,
    #[error("unable to fetch QR code from {url}: {reason}")]
    QrFetch { url: String, reason: String },
    #[error("QR code image could not be decoded: {0}")]
    QrDecode(#[from] image::ImageError),
    #[error("template {path:?} could not be used: {source}")]
    Template {
        path: PathBuf,
        #[source]
        source: lopdf::Error,
    },
    #[error("template has no pages")]
    EmptyTemplate,
    #[error("pdf error: {0}")]
    Pdf(#[from] lopdf::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of QR code image bytes for a record.
#[async_trait]
pub trait QrCodeSource: Send + Sync + Debug {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, StampError>;
}

/// Fetches QR images over HTTP GET.
#[derive(Debug, Clone)]
pub struct HttpQrCodeSource {
    client: reqwest::Client,
}

impl HttpQrCodeSource {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl QrCodeSource for HttpQrCodeSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, StampError> {
        let failure = |reason: String| StampError::QrFetch {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| failure(err.to_string()))?;
        if !response.status().is_success() {
            return Err(failure(format!("HTTP {}", response.status())));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| failure(err.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Placement of the overlays on the first template page, in PDF points.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StampLayout {
    /// The serial is drawn once per offset; the slight shifts thicken the glyphs.
    pub serial_offsets: Vec<(f32, f32)>,
    pub font_size: f32,
    pub qr_origin: (f32, f32),
    pub qr_scale: f32,
}

impl Default for StampLayout {
    fn default() -> Self {
        Self {
            serial_offsets: vec![(140.0, 554.0), (140.5, 554.0), (140.0, 553.5)],
            font_size: 14.0,
            qr_origin: (500.0, 700.0),
            qr_scale: 0.5,
        }
    }
}

#[derive(Debug)]
pub struct DocumentStamper {
    template_path: PathBuf,
    names: SerialFileNames,
    layout: StampLayout,
    qr_source: Box<dyn QrCodeSource>,
}

impl DocumentStamper {
    pub fn new(
        template_path: impl Into<PathBuf>,
        names: SerialFileNames,
        qr_source: Box<dyn QrCodeSource>,
    ) -> Self {
        Self {
            template_path: template_path.into(),
            names,
            layout: StampLayout::default(),
            qr_source,
        }
    }

    pub fn names(&self) -> &SerialFileNames {
        &self.names
    }

    /// Write a stamped copy of the template for one serial into `out_dir`.
    pub async fn stamp(
        &self,
        serial_number: Option<&str>,
        qr_code_url: Option<&str>,
        out_dir: &Path,
    ) -> Result<StampedDocument, StampError> {
        let serial_number = serial_number
            .filter(|serial| !serial.trim().is_empty())
            .ok_or(StampError::MissingSerial)?;
        let qr_code_url = qr_code_url
            .filter(|url| !url.trim().is_empty())
            .ok_or(StampError::MissingQrCode)?;

        debug!(serial_number, path = ?self.template_path, "loading template");
        let mut document =
            Document::load(&self.template_path).map_err(|source| StampError::Template {
                path: self.template_path.clone(),
                source,
            })?;

        debug!(serial_number, qr_code_url, "fetching QR code");
        let qr_bytes = self.qr_source.fetch(qr_code_url).await?;
        let qr_image = image::load_from_memory(&qr_bytes)?.to_rgb8();

        let page_id = document
            .get_pages()
            .values()
            .next()
            .copied()
            .ok_or(StampError::EmptyTemplate)?;

        let font_id = document.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding",
        });
        let (width, height) = qr_image.dimensions();
        let image_stream = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => i64::from(width),
                "Height" => i64::from(height),
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
            },
            qr_image.into_raw(),
        );
        let image_id = document.add_object(image_stream);

        register_resources(&mut document, page_id, font_id, image_id)?;

        let overlay = self.overlay_content(serial_number, width, height)?;
        append_page_content(&mut document, page_id, overlay)?;

        let output = self.names.path_in(out_dir, serial_number);
        document.save(&output)?;
        debug!(serial_number, path = ?output, "stamped document written");

        Ok(StampedDocument {
            serial_number: serial_number.to_string(),
            path: output,
        })
    }

    fn overlay_content(
        &self,
        serial_number: &str,
        image_width: u32,
        image_height: u32,
    ) -> Result<Vec<u8>, StampError> {
        let layout = &self.layout;
        // Closes the `q` pushed in front of the template content.
        let mut operations = vec![Operation::new("Q", vec![])];

        for &(x, y) in &layout.serial_offsets {
            operations.extend([
                Operation::new("BT", vec![]),
                Operation::new(
                    "Tf",
                    vec![FONT_RESOURCE.into(), Object::Real(layout.font_size)],
                ),
                Operation::new(
                    "rg",
                    vec![Object::Integer(0), Object::Integer(0), Object::Integer(0)],
                ),
                Operation::new("Td", vec![Object::Real(x), Object::Real(y)]),
                Operation::new("Tj", vec![Object::string_literal(serial_number)]),
                Operation::new("ET", vec![]),
            ]);
        }

        let (x, y) = layout.qr_origin;
        let drawn_width = image_width as f32 * layout.qr_scale;
        let drawn_height = image_height as f32 * layout.qr_scale;
        operations.extend([
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    Object::Real(drawn_width),
                    Object::Integer(0),
                    Object::Integer(0),
                    Object::Real(drawn_height),
                    Object::Real(x),
                    Object::Real(y),
                ],
            ),
            Operation::new("Do", vec![QR_RESOURCE.into()]),
            Operation::new("Q", vec![]),
        ]);

        Ok(Content { operations }.encode()?)
    }
}

/// Copy the page's effective resources inline and add the stamp font and image.
fn register_resources(
    document: &mut Document,
    page_id: ObjectId,
    font_id: ObjectId,
    image_id: ObjectId,
) -> Result<(), StampError> {
    let mut resources = inherited_attribute(document, page_id, b"Resources")
        .and_then(|object| resolve_dictionary(document, &object))
        .unwrap_or_default();

    let mut fonts = resources
        .get(b"Font")
        .ok()
        .and_then(|object| resolve_dictionary(document, object))
        .unwrap_or_default();
    fonts.set(FONT_RESOURCE, font_id);

    let mut xobjects = resources
        .get(b"XObject")
        .ok()
        .and_then(|object| resolve_dictionary(document, object))
        .unwrap_or_default();
    xobjects.set(QR_RESOURCE, image_id);

    resources.set("Font", fonts);
    resources.set("XObject", xobjects);

    document
        .get_object_mut(page_id)?
        .as_dict_mut()?
        .set("Resources", resources);
    Ok(())
}

/// Wrap the existing page content in `q … Q` and append the overlay after it.
fn append_page_content(
    document: &mut Document,
    page_id: ObjectId,
    overlay: Vec<u8>,
) -> Result<(), StampError> {
    let existing = match document.get_object(page_id)?.as_dict()?.get(b"Contents") {
        Ok(Object::Reference(id)) => match document.get_object(*id) {
            Ok(Object::Array(parts)) => parts.clone(),
            _ => vec![Object::Reference(*id)],
        },
        Ok(Object::Array(parts)) => parts.clone(),
        _ => Vec::new(),
    };

    let save_id = document.add_object(Stream::new(Dictionary::new(), b"q\n".to_vec()));
    let overlay_id = document.add_object(Stream::new(Dictionary::new(), overlay));

    let mut contents = Vec::with_capacity(existing.len() + 2);
    contents.push(Object::Reference(save_id));
    contents.extend(existing);
    contents.push(Object::Reference(overlay_id));

    document
        .get_object_mut(page_id)?
        .as_dict_mut()?
        .set("Contents", contents);
    Ok(())
}

/// Look an attribute up on the page, then along its `Parent` chain.
pub(crate) fn inherited_attribute(
    document: &Document,
    page_id: ObjectId,
    key: &[u8],
) -> Option<Object> {
    let mut node = document.get_object(page_id).ok()?.as_dict().ok()?;
    for _ in 0..INHERITABLE_DEPTH {
        if let Ok(value) = node.get(key) {
            return Some(value.clone());
        }
        let parent = node.get(b"Parent").ok()?.as_reference().ok()?;
        node = document.get_object(parent).ok()?.as_dict().ok()?;
    }
    None
}

fn resolve_dictionary(document: &Document, object: &Object) -> Option<Dictionary> {
    match object {
        Object::Dictionary(dict) => Some(dict.clone()),
        Object::Reference(id) => document.get_object(*id).ok()?.as_dict().ok().cloned(),
        _ => None,
    }
}
