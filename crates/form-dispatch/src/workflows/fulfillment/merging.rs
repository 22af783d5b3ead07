use std::path::{Path, PathBuf};

use lopdf::{dictionary, Dictionary, Document, Object, ObjectId};
use tracing::debug;

use super::naming::SerialFileNames;
use super::stamping::inherited_attribute;

/// Page attributes a page may inherit from its page-tree ancestors.
const INHERITABLE_KEYS: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

/// Node types rebuilt for the merged document instead of being copied.
const REBUILT_TYPES: [&[u8]; 5] = [b"Catalog", b"Pages", b"Page", b"Outlines", b"Outline"];

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("no documents to merge")]
    Empty,
    #[error("unable to read {path:?}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: lopdf::Error,
    },
    #[error("pdf error: {0}")]
    Pdf(#[from] lopdf::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedDocument {
    pub path: PathBuf,
    pub page_count: usize,
}

/// Concatenates an applicant's stamped documents in ascending serial order.
#[derive(Debug, Clone)]
pub struct DocumentMerger {
    names: SerialFileNames,
}

impl DocumentMerger {
    pub fn new(names: SerialFileNames) -> Self {
        Self { names }
    }

    /// Sort by the serial embedded in each file name; ties keep input order.
    pub fn order(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        let mut ordered = paths.to_vec();
        ordered.sort_by_key(|path| self.names.serial_of(path));
        ordered
    }

    pub fn merge(&self, paths: &[PathBuf], output: &Path) -> Result<MergedDocument, MergeError> {
        if paths.is_empty() {
            return Err(MergeError::Empty);
        }

        let sources = self.order(paths);
        let mut merged = Document::with_version("1.5");
        let mut pages: Vec<(ObjectId, Dictionary)> = Vec::new();
        let mut next_id = 1;

        for path in &sources {
            let mut document = Document::load(path).map_err(|source| MergeError::Load {
                path: path.clone(),
                source,
            })?;
            document.renumber_objects_with(next_id);
            next_id = document.max_id + 1;

            for page_id in document.get_pages().into_values() {
                let mut page = document.get_object(page_id)?.as_dict()?.clone();
                for key in INHERITABLE_KEYS {
                    if page.has(key) {
                        continue;
                    }
                    if let Some(value) = inherited_attribute(&document, page_id, key) {
                        page.set(key.to_vec(), value);
                    }
                }
                pages.push((page_id, page));
            }

            for (object_id, object) in document.objects {
                if !is_rebuilt(&object) {
                    merged.objects.insert(object_id, object);
                }
            }
        }

        merged.max_id = next_id - 1;
        let pages_id = merged.new_object_id();
        let mut kids = Vec::with_capacity(pages.len());
        for (page_id, mut page) in pages {
            page.set("Parent", pages_id);
            merged.objects.insert(page_id, Object::Dictionary(page));
            kids.push(Object::Reference(page_id));
        }
        let page_count = kids.len();

        merged.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => page_count as i64,
            }),
        );
        let catalog_id = merged.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        merged.trailer.set("Root", catalog_id);
        merged.save(output)?;

        debug!(path = ?output, page_count, "merged applicant documents");

        Ok(MergedDocument {
            path: output.to_path_buf(),
            page_count,
        })
    }
}

fn is_rebuilt(object: &Object) -> bool {
    object
        .as_dict()
        .ok()
        .and_then(|dict| dict.get(b"Type").ok())
        .and_then(|kind| kind.as_name().ok())
        .map(|kind| REBUILT_TYPES.contains(&kind))
        .unwrap_or(false)
}
