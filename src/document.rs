use anyhow::{Context, Result};
use log::{debug, info, warn};
use mime_guess::{from_path, Mime};
use pdf_extract::extract_text;
use std::fs;
use std::path::Path;

/// Text extracted from an uploaded file
#[derive(Debug, Clone)]
pub struct Document {
    /// Normalised text content of the document
    pub content: String,
    /// Display name the document was uploaded under (used as document ID)
    pub file_name: String,
    /// The document's MIME type
    pub mime_type: String,
}

impl Document {
    /// Load a document from `path`, recording it under `file_name`.
    ///
    /// Uploads usually land in temporary files, so the MIME type is guessed
    /// from the display name first and only then from the path.
    pub fn load<P: AsRef<Path>>(path: P, file_name: &str) -> Result<Self> {
        let path = path.as_ref();
        let mime = detect_mime(path, file_name);
        debug!("Detected MIME type {} for {}", mime, file_name);

        let content = read_document_content(path, mime.essence_str())?;

        Ok(Document {
            content,
            file_name: file_name.to_string(),
            mime_type: mime.to_string(),
        })
    }
}

fn detect_mime(path: &Path, file_name: &str) -> Mime {
    from_path(file_name)
        .first()
        .or_else(|| from_path(path).first())
        .unwrap_or(mime_guess::mime::APPLICATION_OCTET_STREAM)
}

/// Read content from a document based on its MIME type
pub fn read_document_content<P: AsRef<Path>>(file_path: P, mime_type: &str) -> Result<String> {
    let path = file_path.as_ref();

    match mime_type {
        "application/pdf" => {
            info!("Extracting text from PDF {}", path.display());
            let raw = extract_text(path)
                .with_context(|| format!("Failed to extract text from PDF: {}", path.display()))?;
            let content = normalize_whitespace(&raw);
            if content.is_empty() {
                warn!("PDF {} contains no extractable text", path.display());
            }
            Ok(content)
        }

        mime if mime.starts_with("text/") => {
            info!("Reading text document {}", path.display());
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Failed to read text file: {}", path.display()))?;
            Ok(normalize_whitespace(&raw))
        }

        _ => Err(anyhow::anyhow!(
            "Unsupported document format: {}. Only text and PDF files are supported.",
            mime_type
        )),
    }
}

/// Collapse runs of spaces, cap blank lines at one, and drop carriage returns
fn normalize_whitespace(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len());
    let mut pending_newlines = 0usize;

    for c in text.chars().filter(|&c| c != '\r') {
        match c {
            '\n' => pending_newlines += 1,
            ' ' if pending_newlines == 0 && normalized.ends_with(' ') => {}
            _ => {
                if pending_newlines > 0 {
                    normalized.push_str(if pending_newlines > 1 { "\n\n" } else { "\n" });
                    pending_newlines = 0;
                }
                normalized.push(c);
            }
        }
    }

    normalized.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_normalize_whitespace() {
        let text = "This  has   multiple    spaces.\n\n\nAnd multiple newlines.\r\nAnd Windows line endings.";
        let expected =
            "This has multiple spaces.\n\nAnd multiple newlines.\nAnd Windows line endings.";
        assert_eq!(normalize_whitespace(text), expected);
    }

    #[test]
    fn test_load_uses_display_name_for_mime() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Inverter fault codes\r\n\r\n\r\nE01 means grid loss.").unwrap();

        let document = Document::load(file.path(), "faults.txt").unwrap();
        assert_eq!(document.file_name, "faults.txt");
        assert!(document.mime_type.starts_with("text/plain"));
        assert_eq!(document.content, "Inverter fault codes\n\nE01 means grid loss.");
    }

    #[test]
    fn test_unsupported_format() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = Document::load(file.path(), "archive.zip").unwrap_err();
        assert!(err.to_string().contains("Unsupported document format"));
    }
}
