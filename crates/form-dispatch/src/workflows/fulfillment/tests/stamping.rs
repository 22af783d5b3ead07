use std::path::{Path, PathBuf};

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object};

use super::common::*;
use crate::workflows::fulfillment::{DocumentStamper, SerialFileNames, StampError};

fn stamper(template: PathBuf) -> DocumentStamper {
    DocumentStamper::new(
        template,
        SerialFileNames::new(PREFIX).expect("valid prefix"),
        Box::new(StaticQrSource),
    )
}

fn numbers(operation: &Operation) -> Vec<f32> {
    operation
        .operands
        .iter()
        .map(|operand| operand.as_float().expect("numeric operand"))
        .collect()
}

fn page_operations(path: &Path) -> (Document, Vec<Operation>) {
    let document = Document::load(path).expect("stamped pdf loads");
    let page_id = *document.get_pages().values().next().expect("one page");
    let content = document
        .get_page_content(page_id)
        .expect("page content reads");
    let operations = Content::decode(&content)
        .expect("content parses")
        .operations;
    (document, operations)
}

fn write_pageless_template(dir: &Path) -> PathBuf {
    let mut document = Document::with_version("1.5");
    let pages_id = document.add_object(dictionary! {
        "Type" => "Pages",
        "Kids" => Vec::<Object>::new(),
        "Count" => 0,
    });
    let catalog_id = document.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    document.trailer.set("Root", catalog_id);
    let path = dir.join("pageless.pdf");
    document.save(&path).expect("template saves");
    path
}

#[tokio::test]
async fn overlay_draws_serial_three_times_and_places_qr() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stamped = stamper(write_template(dir.path()))
        .stamp(Some("0042"), Some("https://qr.test/42"), dir.path())
        .await
        .expect("stamps");
    assert_eq!(stamped.serial_number, "0042");
    assert_eq!(stamped.path, dir.path().join("Hatua_Application_0042.pdf"));

    let (_, operations) = page_operations(&stamped.path);
    assert_eq!(operations[0].operator, "q");
    let restore = operations
        .iter()
        .position(|op| op.operator == "Q")
        .expect("template state restored");
    assert!(operations[1..restore]
        .iter()
        .any(|op| op.operator == "Tj"));

    let overlay = &operations[restore + 1..];
    let offsets: Vec<Vec<f32>> = overlay
        .iter()
        .filter(|op| op.operator == "Td")
        .map(numbers)
        .collect();
    assert_eq!(
        offsets,
        vec![vec![140.0, 554.0], vec![140.5, 554.0], vec![140.0, 553.5]]
    );
    let serials: Vec<Vec<u8>> = overlay
        .iter()
        .filter(|op| op.operator == "Tj")
        .map(|op| op.operands[0].as_str().expect("string operand").to_vec())
        .collect();
    assert_eq!(serials, vec![b"0042".to_vec(); 3]);
    let font = overlay
        .iter()
        .find(|op| op.operator == "Tf")
        .expect("font selected");
    assert_eq!(font.operands[0].as_name().expect("font name"), b"FDStampFont");
    assert_eq!(font.operands[1].as_float().expect("font size"), 14.0);

    // The 8px test QR drawn at half scale.
    let placement = overlay
        .iter()
        .find(|op| op.operator == "cm")
        .expect("qr placement");
    assert_eq!(numbers(placement), vec![4.0, 0.0, 0.0, 4.0, 500.0, 700.0]);
    let drawn = overlay
        .iter()
        .find(|op| op.operator == "Do")
        .expect("qr drawn");
    assert_eq!(drawn.operands[0].as_name().expect("xobject name"), b"FDStampQr");
    assert_eq!(overlay.last().map(|op| op.operator.as_str()), Some("Q"));
}

#[tokio::test]
async fn inherited_resources_are_kept_alongside_stamp_resources() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stamped = stamper(write_template(dir.path()))
        .stamp(Some("7"), Some("https://qr.test/7"), dir.path())
        .await
        .expect("stamps");

    let (document, _) = page_operations(&stamped.path);
    let page_id = *document.get_pages().values().next().expect("one page");
    let page = document
        .get_object(page_id)
        .and_then(|object| object.as_dict())
        .expect("page dictionary");
    let resources = page
        .get(b"Resources")
        .and_then(|object| object.as_dict())
        .expect("page carries its resources");
    let fonts = resources
        .get(b"Font")
        .and_then(|object| object.as_dict())
        .expect("font resources");
    assert!(fonts.has(b"F1"));
    assert!(fonts.has(b"FDStampFont"));
    let xobjects = resources
        .get(b"XObject")
        .and_then(|object| object.as_dict())
        .expect("xobject resources");
    assert!(xobjects.has(b"FDStampQr"));
}

#[tokio::test]
async fn incomplete_records_and_unusable_templates_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let documents = stamper(write_template(dir.path()));

    assert!(matches!(
        documents.stamp(None, Some("https://qr.test/1"), dir.path()).await,
        Err(StampError::MissingSerial)
    ));
    assert!(matches!(
        documents.stamp(Some("1"), None, dir.path()).await,
        Err(StampError::MissingQrCode)
    ));
    assert!(matches!(
        documents.stamp(Some("1"), Some("  "), dir.path()).await,
        Err(StampError::MissingQrCode)
    ));
    assert!(matches!(
        documents.stamp(Some("1"), Some(BROKEN_QR), dir.path()).await,
        Err(StampError::QrFetch { .. })
    ));
    assert!(!dir.path().join("Hatua_Application_1.pdf").exists());

    let pageless = stamper(write_pageless_template(dir.path()));
    assert!(matches!(
        pageless
            .stamp(Some("1"), Some("https://qr.test/1"), dir.path())
            .await,
        Err(StampError::EmptyTemplate)
    ));

    let missing = stamper(dir.path().join("missing.pdf"));
    assert!(matches!(
        missing
            .stamp(Some("1"), Some("https://qr.test/1"), dir.path())
            .await,
        Err(StampError::Template { .. })
    ));
}
