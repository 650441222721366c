//! In-process text extraction from uploaded resumes.

use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::{Cursor, Read};

use crate::errors::AppError;

pub const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Pdf,
    Docx,
}

/// Determines the upload kind from the filename extension, falling back to
/// magic bytes.
pub fn detect_kind(filename: &str, bytes: &[u8]) -> Result<UploadKind, AppError> {
    let ext = filename.rsplit('.').next().unwrap_or("").to_lowercase();
    match ext.as_str() {
        "pdf" => return Ok(UploadKind::Pdf),
        "docx" => return Ok(UploadKind::Docx),
        _ => {}
    }
    if bytes.starts_with(b"%PDF") {
        return Ok(UploadKind::Pdf);
    }
    if bytes.starts_with(b"PK") {
        return Ok(UploadKind::Docx);
    }
    Err(AppError::Validation(
        "only PDF and DOCX uploads are supported".into(),
    ))
}

pub fn extract_text(kind: UploadKind, bytes: &[u8]) -> Result<String, AppError> {
    let text = match kind {
        UploadKind::Pdf => pdf_extract::extract_text_from_mem(bytes).map_err(|e| {
            AppError::processing(
                format!("Could not read text from the PDF: {e}"),
                "Upload a text-based PDF, not a scanned image.",
            )
        })?,
        UploadKind::Docx => extract_docx_text(bytes)?,
    };

    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(AppError::processing(
            "The uploaded file contains no extractable text.",
            "Upload a text-based resume, not a scanned image.",
        ));
    }
    Ok(text)
}

/// Pulls the text runs out of word/document.xml. Paragraph boundaries become
/// newlines, explicit tabs become tabs.
fn extract_docx_text(bytes: &[u8]) -> Result<String, AppError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|_| AppError::Validation("not a valid DOCX archive".into()))?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|_| AppError::Validation("DOCX archive has no document body".into()))?
        .read_to_string(&mut xml)
        .map_err(|_| AppError::Validation("DOCX document body is not UTF-8".into()))?;

    let mut reader = Reader::from_str(&xml);
    let mut out = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Text(t)) => {
                if let Ok(text) = t.unescape() {
                    out.push_str(&text);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"w:p" => out.push('\n'),
            Ok(Event::Empty(e)) if e.name().as_ref() == b"w:tab" => out.push('\t'),
            Ok(Event::Eof) => break,
            Err(_) => {
                return Err(AppError::Validation("DOCX document body is malformed".into()))
            }
            _ => {}
        }
    }
    Ok(out)
}
