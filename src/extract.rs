//! Plain text from uploaded bytes.
//!
//! PDFs are recognised by their `%PDF-` header and run through
//! `pdf-extract`. Everything else must be UTF-8 text.

use std::{borrow::Cow, panic::AssertUnwindSafe};

use crate::error::{Error, Result};

/// Readers accept junk before the header as long as it starts within the
/// first kilobyte.
const PDF_HEADER_WINDOW: usize = 1024;

pub fn is_pdf(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(PDF_HEADER_WINDOW)];
    head.windows(5).any(|w| w == b"%PDF-")
}

/// Text of every page, in page order.
pub fn pdf_text(bytes: &[u8]) -> Result<String> {
    // pdf-extract panics on some malformed files instead of erroring.
    let extracted = std::panic::catch_unwind(AssertUnwindSafe(|| {
        pdf_extract::extract_text_from_mem(bytes)
    }))
    .map_err(|_| Error::Ingest("PDF could not be parsed".into()))?;

    extracted.map_err(|e| Error::Ingest(format!("could not read PDF: {e}")))
}

pub fn utf8_text(bytes: &[u8]) -> Result<&str> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let text = std::str::from_utf8(bytes).map_err(|e| {
        Error::Ingest(format!("document is not valid UTF-8 text: {e}"))
    })?;
    if text.contains('\0') {
        return Err(Error::Ingest(
            "document looks binary; only text and PDF documents are supported"
                .into(),
        ));
    }
    Ok(text)
}

/// Decode a document of any supported format.
pub fn document_text(bytes: &[u8]) -> Result<Cow<'_, str>> {
    if is_pdf(bytes) {
        pdf_text(bytes).map(Cow::Owned)
    } else {
        utf8_text(bytes).map(Cow::Borrowed)
    }
}

/// A one-page PDF showing `text` in Helvetica, with a valid xref table.
#[cfg(test)]
pub(crate) fn sample_pdf(text: &str) -> Vec<u8> {
    let content = format!("BT /F1 12 Tf 72 720 Td ({text}) Tj ET");
    let objects = [
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] \
         /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >>"
            .to_string(),
        format!(
            "<< /Length {} >>\nstream\n{content}\nendstream",
            content.len()
        ),
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica \
         /Encoding /WinAnsiEncoding >>"
            .to_string(),
    ];

    let mut out = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(
            format!("{} 0 obj\n{body}\nendobj\n", i + 1).as_bytes(),
        );
    }

    let xref_at = out.len();
    out.extend_from_slice(
        format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1)
            .as_bytes(),
    );
    for offset in offsets {
        out.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref_at}\n%%EOF\n",
            objects.len() + 1
        )
        .as_bytes(),
    );
    out
}
