//! Turning files on disk into [`SourceInput`]s.
//!
//! Text files are decoded as UTF-8 first and Shift_JIS second; PDFs go
//! through `pdf-extract`. Every failure is reported as [`Error::Decode`]
//! naming the file.

use std::path::Path;

use crate::{
    error::{Error, Result},
    source::{SourceInput, SourceType},
};

/// Decode raw bytes, trying UTF-8 and then Shift_JIS.
///
/// # Examples
///
/// ```
/// use fusionrag::loader::decode_text;
///
/// assert_eq!(decode_text(b"plain", "a.txt").unwrap(), "plain");
/// // "日本" in Shift_JIS
/// assert_eq!(decode_text(&[0x93, 0xfa, 0x96, 0x7b], "b.txt").unwrap(), "日本");
/// ```
pub fn decode_text(bytes: &[u8], source_name: &str) -> Result<String> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Ok(text.to_string());
    }

    encoding_rs::SHIFT_JIS
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|text| text.into_owned())
        .ok_or_else(|| Error::Decode {
            source_name: source_name.to_string(),
            reason: "not valid UTF-8 or Shift_JIS".to_string(),
        })
}

/// Infer the source type from a file extension. Anything that is not a PDF
/// is read as text.
pub fn source_type_for(path: &Path) -> SourceType {
    let is_pdf = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
    if is_pdf {
        SourceType::Pdf
    } else {
        SourceType::TextFile
    }
}

/// Display name of a file source: its file name.
pub fn source_name_for(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Read a text file from disk.
pub fn load_text_file(path: &Path) -> Result<SourceInput> {
    let name = source_name_for(path);
    let bytes = read_bytes(path, &name)?;
    let text = decode_text(&bytes, &name)?;
    Ok(SourceInput::new(SourceType::TextFile, name, text))
}

/// Extract the text layer of a PDF.
pub fn load_pdf(path: &Path) -> Result<SourceInput> {
    let name = source_name_for(path);
    let bytes = read_bytes(path, &name)?;
    let text = pdf_extract::extract_text_from_mem(&bytes).map_err(|e| {
        Error::Decode {
            source_name: name.clone(),
            reason: format!("PDF extraction failed: {e}"),
        }
    })?;
    Ok(SourceInput::new(SourceType::Pdf, name, text))
}

/// Load any supported file, dispatching on its extension.
pub fn load_file(path: &Path) -> Result<SourceInput> {
    match source_type_for(path) {
        SourceType::Pdf => load_pdf(path),
        _ => load_text_file(path),
    }
}

fn read_bytes(path: &Path, source_name: &str) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| Error::Decode {
        source_name: source_name.to_string(),
        reason: e.to_string(),
    })
}
