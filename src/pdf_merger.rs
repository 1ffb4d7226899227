use async_trait::async_trait;
use lopdf::{dictionary, Document, Object, ObjectId, StringFormat};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::error::{ExportError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeSummary {
    pub documents: usize,
    pub pages: usize,
}

/// Concatenates PDFs in the given order into one output file.
#[async_trait]
pub trait Merger: Send + Sync {
    async fn merge(&self, inputs: &[PathBuf], output: &Path, title: Option<&str>) -> Result<MergeSummary>;
}

pub struct PdfMerger {
    documents: Vec<(String, Document)>,
}

impl PdfMerger {
    pub fn new() -> Self {
        Self {
            documents: Vec::new(),
        }
    }

    pub async fn add_pdf(&mut self, path: &Path) -> Result<()> {
        let data = fs::read(path)
            .await
            .map_err(|e| ExportError::io(format!("Failed to read PDF file {}", path.display()), e))?;

        let document = Document::load_mem(&data).map_err(|source| ExportError::Pdf {
            path: path.to_path_buf(),
            source,
        })?;

        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown.pdf")
            .to_string();

        debug!("Loaded PDF with {} pages from {}", document.get_pages().len(), path.display());
        self.documents.push((filename, document));

        Ok(())
    }

    /// Builds the combined document without touching the filesystem.
    pub fn combine(self, title: Option<&str>) -> Result<Document> {
        let mut documents = self.documents.into_iter();
        let (first_name, mut merged_doc) = documents.next().ok_or(ExportError::NothingToMerge)?;
        let pdf_error = |name: &str, source| ExportError::Pdf {
            path: PathBuf::from(name),
            source,
        };

        let root_pages = root_pages_id(&merged_doc).map_err(|e| pdf_error(first_name.as_str(), e))?;
        debug!("First document has {} pages", merged_doc.get_pages().len());

        let mut max_id = merged_doc.max_id;

        for (i, (filename, mut document)) in documents.enumerate() {
            debug!(
                "Processing document {}: {} with {} pages",
                i + 2,
                filename,
                document.get_pages().len()
            );

            // Renumber objects to avoid conflicts
            document.renumber_objects_with(max_id + 1);
            max_id = document.max_id;

            let subtree = root_pages_id(&document).map_err(|e| pdf_error(filename.as_str(), e))?;
            let page_count = document.get_pages().len() as i64;

            merged_doc.objects.extend(document.objects);

            // Hang the document's page tree under ours so inherited attributes survive.
            graft_page_tree(&mut merged_doc, root_pages, subtree, page_count)
                .map_err(|e| pdf_error(filename.as_str(), e))?;
        }

        merged_doc.max_id = max_id;

        if let Some(title) = title {
            set_title(&mut merged_doc, title);
        }

        merged_doc.prune_objects();
        merged_doc.renumber_objects();
        merged_doc.compress();

        Ok(merged_doc)
    }

    /// Writes the merged document to `output`. Nothing is left at `output` on failure.
    pub async fn save(self, output_path: &Path, title: Option<&str>) -> Result<MergeSummary> {
        let documents = self.documents.len();
        info!("Starting PDF merge process with {} documents", documents);

        let mut merged_doc = self.combine(title)?;
        let pages = merged_doc.get_pages().len();
        info!("Finalizing merged PDF with {} total pages", pages);

        let mut data = Vec::new();
        merged_doc.save_to(&mut data).map_err(|e| {
            ExportError::io("Failed to serialize merged PDF", std::io::Error::other(e.to_string()))
        })?;

        let partial = partial_path(output_path);
        fs::write(&partial, data)
            .await
            .map_err(|e| ExportError::io(format!("Failed to write merged PDF to {}", partial.display()), e))?;

        if let Err(e) = fs::rename(&partial, output_path).await {
            fs::remove_file(&partial).await.ok();
            return Err(ExportError::io(
                format!("Failed to move merged PDF to {}", output_path.display()),
                e,
            ));
        }

        info!("Successfully merged {} PDFs into {}", documents, output_path.display());
        Ok(MergeSummary { documents, pages })
    }
}

impl Default for PdfMerger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Merger for PdfMerger {
    async fn merge(&self, inputs: &[PathBuf], output: &Path, title: Option<&str>) -> Result<MergeSummary> {
        if inputs.is_empty() {
            return Err(ExportError::NothingToMerge);
        }

        let mut merger = PdfMerger::new();
        for input in inputs {
            merger.add_pdf(input).await?;
        }
        merger.save(output, title).await
    }
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    output.with_file_name(name)
}

fn root_pages_id(doc: &Document) -> lopdf::Result<ObjectId> {
    doc.catalog()?.get(b"Pages")?.as_reference()
}

fn graft_page_tree(
    merged: &mut Document,
    root: ObjectId,
    subtree: ObjectId,
    page_count: i64,
) -> lopdf::Result<()> {
    merged
        .get_object_mut(subtree)?
        .as_dict_mut()?
        .set("Parent", Object::Reference(root));

    let pages_dict = merged.get_object_mut(root)?.as_dict_mut()?;
    pages_dict.get_mut(b"Kids")?.as_array_mut()?.push(Object::Reference(subtree));

    let count = pages_dict.get(b"Count")?.as_i64()?;
    pages_dict.set("Count", Object::Integer(count + page_count));
    Ok(())
}

fn set_title(doc: &mut Document, title: &str) {
    let info_id = doc.trailer.get(b"Info").and_then(Object::as_reference).ok();

    if let Some(info) = info_id
        .and_then(|id| doc.get_object_mut(id).ok())
        .and_then(|obj| obj.as_dict_mut().ok())
    {
        info.set("Title", text_string(title));
        return;
    }

    let info_id = doc.add_object(dictionary! {
        "Title" => text_string(title),
    });
    doc.trailer.set("Info", Object::Reference(info_id));
}

/// PDF text string: literal for ASCII, otherwise UTF-16BE behind a byte order mark.
fn text_string(text: &str) -> Object {
    if text.is_ascii() {
        return Object::string_literal(text);
    }

    let mut bytes = vec![0xFE, 0xFF];
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_be_bytes());
    }
    Object::String(bytes, StringFormat::Hexadecimal)
}
