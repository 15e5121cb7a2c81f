//! Plain-text renditions of binary documents (PDF, XLSX/XLSM).
//!
//! Rendering never panics on malformed input; it returns a [`RenderError`]
//! and the caller rejects the file.

use std::io::Read;

use quick_xml::events::Event;
use thiserror::Error;

/// Maximum decompressed bytes read from one ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
const MAX_SHEETS: usize = 100;
const MAX_CELLS_PER_SHEET: usize = 100_000;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no text renderer for .{0} files")]
    Unsupported(String),
    #[error("PDF text extraction failed: {0}")]
    Pdf(String),
    #[error("spreadsheet extraction failed: {0}")]
    Spreadsheet(String),
}

/// Render `bytes` of a file with the given lowercase extension.
pub fn render_text(bytes: &[u8], extension: &str) -> Result<String, RenderError> {
    match extension {
        "pdf" => render_pdf(bytes),
        "xlsx" | "xlsm" => render_spreadsheet(bytes),
        "txt" | "md" | "csv" | "html" | "htm" => Ok(String::from_utf8_lossy(bytes).into_owned()),
        other => Err(RenderError::Unsupported(other.to_string())),
    }
}

pub fn render_pdf(bytes: &[u8]) -> Result<String, RenderError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| RenderError::Pdf(e.to_string()))
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn spreadsheet_err(e: impl std::fmt::Display) -> RenderError {
    RenderError::Spreadsheet(e.to_string())
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Option<Vec<u8>>, RenderError> {
    let entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(spreadsheet_err(e)),
    };
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(spreadsheet_err)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(RenderError::Spreadsheet(format!(
            "{} exceeds {} bytes",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(Some(out))
}

/// One line per row, cells separated by tabs, sheets separated by a blank line.
pub fn render_spreadsheet(bytes: &[u8]) -> Result<String, RenderError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(spreadsheet_err)?;
    let shared = match read_entry(&mut archive, "xl/sharedStrings.xml")? {
        Some(xml) => shared_strings(&xml)?,
        None => Vec::new(),
    };

    let mut sheets: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    sheets.sort_by_key(|n| {
        n.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut rendered = Vec::new();
    for name in sheets.into_iter().take(MAX_SHEETS) {
        if let Some(xml) = read_entry(&mut archive, &name)? {
            let text = sheet_rows(&xml, &shared)?;
            if !text.is_empty() {
                rendered.push(text);
            }
        }
    }
    Ok(rendered.join("\n\n"))
}

/// `<si>` entries, concatenating rich-text runs.
fn shared_strings(xml: &[u8]) -> Result<Vec<String>, RenderError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf).map_err(spreadsheet_err)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = true,
                _ => {}
            },
            Event::Text(t) if in_text => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&t.unescape().map_err(spreadsheet_err)?);
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_text = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

#[derive(PartialEq)]
enum CellKind {
    Shared,
    Inline,
    Value,
}

fn sheet_rows(xml: &[u8], shared: &[String]) -> Result<String, RenderError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut rows: Vec<String> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut kind = CellKind::Value;
    let mut capture = false;
    let mut cells = 0usize;

    loop {
        match reader.read_event_into(&mut buf).map_err(spreadsheet_err)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"row" => row.clear(),
                b"c" => {
                    kind = CellKind::Value;
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"t" {
                            kind = match attr.value.as_ref() {
                                b"s" => CellKind::Shared,
                                b"inlineStr" => CellKind::Inline,
                                _ => CellKind::Value,
                            };
                        }
                    }
                }
                b"v" => capture = kind != CellKind::Inline,
                b"t" => capture = kind == CellKind::Inline,
                _ => {}
            },
            Event::Text(t) if capture => {
                let raw = t.unescape().map_err(spreadsheet_err)?;
                let value = raw.trim();
                let text = match kind {
                    CellKind::Shared => value
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared.get(i))
                        .cloned()
                        .unwrap_or_default(),
                    _ => value.to_string(),
                };
                if !text.is_empty() {
                    row.push(text);
                    cells += 1;
                }
                capture = false;
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"row" if !row.is_empty() => rows.push(row.join("\t")),
                b"v" | b"t" => capture = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
        if cells >= MAX_CELLS_PER_SHEET {
            break;
        }
    }
    Ok(rows.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn xlsx(files: &[(&str, &str)]) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (name, body) in files {
                zip.start_file(*name, options).unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn spreadsheet_rows_mix_shared_inline_and_numbers() {
        let bytes = xlsx(&[
            (
                "xl/sharedStrings.xml",
                r#"<sst><si><t>Invoice</t></si><si><r><t>Tot</t></r><r><t>al</t></r></si></sst>"#,
            ),
            (
                "xl/worksheets/sheet1.xml",
                r#"<worksheet><sheetData>
                    <row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1"><v>42</v></c></row>
                    <row r="2"><c r="A2" t="s"><v>1</v></c><c r="B2" t="inlineStr"><is><t>EUR</t></is></c></row>
                </sheetData></worksheet>"#,
            ),
        ]);
        assert_eq!(
            render_spreadsheet(&bytes).unwrap(),
            "Invoice\t42\nTotal\tEUR"
        );
    }

    #[test]
    fn spreadsheet_without_shared_strings() {
        let bytes = xlsx(&[(
            "xl/worksheets/sheet1.xml",
            r#"<worksheet><sheetData><row><c><v>7</v></c></row></sheetData></worksheet>"#,
        )]);
        assert_eq!(render_spreadsheet(&bytes).unwrap(), "7");
    }

    #[test]
    fn malformed_inputs_are_errors() {
        assert!(matches!(render_text(b"not a pdf", "pdf"), Err(RenderError::Pdf(_))));
        assert!(matches!(
            render_text(b"not a zip", "xlsx"),
            Err(RenderError::Spreadsheet(_))
        ));
        assert!(matches!(
            render_text(b"", "bin"),
            Err(RenderError::Unsupported(_))
        ));
    }
}
