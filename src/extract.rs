//! Text extraction for uploaded documents.
//!
//! Dispatch is keyed by file extension ([`FileKind`]): `pdf` via pdf-extract,
//! `docx` by pulling `w:t` text runs out of the OOXML container, `txt`/`md`
//! read as UTF-8. Adding a format means adding a [`FileKind`] variant and a
//! match arm.

use std::io::Read;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Supported upload formats, parsed from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Pdf,
    Docx,
    Txt,
    Md,
}

impl FileKind {
    /// Parse a file name's extension. Case-insensitive.
    pub fn from_file_name(name: &str) -> Result<Self, ExtractError> {
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => Ok(FileKind::Pdf),
            "docx" => Ok(FileKind::Docx),
            "txt" => Ok(FileKind::Txt),
            "md" => Ok(FileKind::Md),
            _ => Err(ExtractError::UnsupportedType(ext)),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            FileKind::Pdf => "pdf",
            FileKind::Docx => "docx",
            FileKind::Txt => "txt",
            FileKind::Md => "md",
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported file type: '{0}'")]
    UnsupportedType(String),
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
}

/// Extract the full text of a stored document.
///
/// Extraction is synchronous (PDF parsing in particular is CPU-bound), so it
/// runs on the blocking pool to keep the async runtime free for other
/// in-flight ingestion and answer runs.
pub async fn extract_text(path: &Path, kind: FileKind) -> Result<String, ExtractError> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || extract_text_sync(&path, kind))
        .await
        .map_err(|e| ExtractError::Io(std::io::Error::other(e)))?
}

fn extract_text_sync(path: &Path, kind: FileKind) -> Result<String, ExtractError> {
    match kind {
        FileKind::Pdf => extract_pdf(path),
        FileKind::Docx => extract_docx(path),
        FileKind::Txt | FileKind::Md => Ok(std::fs::read_to_string(path)?),
    }
}

fn extract_pdf(path: &Path) -> Result<String, ExtractError> {
    let bytes = std::fs::read(path)?;
    pdf_extract::extract_text_from_mem(&bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_docx(path: &Path) -> Result<String, ExtractError> {
    let bytes = std::fs::read(path)?;
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.as_slice()))
        .map_err(|e| ExtractError::Docx(e.to_string()))?;

    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Docx("word/document.xml not found".to_string()))?;
    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }

    collect_text_runs(&doc_xml)
}

/// Collect the character content of `w:t` elements, separating paragraphs
/// (`w:p`) with newlines.
fn collect_text_runs(xml: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_text_run = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text_run = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_text_run => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"t" => in_text_run = false,
                    b"p" => out.push('\n'),
                    _ => {}
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}
