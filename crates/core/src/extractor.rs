use crate::chunking::{normalize_lines, normalize_paragraphs};
use crate::error::IngestError;
use crate::models::{FormatTag, Locator};
use calamine::Reader;
use quick_xml::events::Event;
use std::io::{Cursor, Read};
use std::path::Path;

/// Rows per spreadsheet or CSV section, so locators stay narrow.
const ROWS_PER_SECTION: usize = 50;
/// Decompressed size cap for a single zip member.
const MAX_ZIP_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const PDF_MAGIC: &[u8] = b"%PDF";

/// Normalized text of one addressable part of a file (a page, a slide, a block of rows).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedSection {
    pub locator: Option<Locator>,
    pub text: String,
}

impl FormatTag {
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "txt" | "md" | "markdown" | "text" | "log" => Some(Self::PlainText),
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::WordProcessor),
            "xlsx" | "xlsm" | "xls" | "ods" => Some(Self::Spreadsheet),
            "csv" | "tsv" => Some(Self::Delimited),
            "pptx" => Some(Self::SlideDeck),
            _ => None,
        }
    }

    pub fn is_supported_path(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
            .is_some()
    }

    /// Runs the extractor for this format.
    pub fn extract(self, path: &Path, bytes: &[u8]) -> Result<Vec<ExtractedSection>, IngestError> {
        let label = path.display().to_string();
        match self {
            Self::PlainText => Ok(extract_plain_text(bytes)),
            Self::Pdf => extract_pdf(&label, bytes),
            Self::WordProcessor => extract_docx(&label, bytes),
            Self::Spreadsheet => extract_spreadsheet(&label, bytes),
            Self::Delimited => extract_delimited(&label, bytes),
            Self::SlideDeck => extract_pptx(&label, bytes),
        }
    }
}

/// Picks the format from the extension and checks it against the content's
/// magic bytes. Files without an extension are sniffed.
pub fn detect_format(path: &Path, bytes: &[u8]) -> Result<FormatTag, IngestError> {
    let label = path.display().to_string();
    let extension = path.extension().and_then(|ext| ext.to_str());

    let Some(extension) = extension else {
        return sniff_format(&label, bytes);
    };

    let format = FormatTag::from_extension(extension)
        .ok_or_else(|| IngestError::UnsupportedFormat(format!(".{extension} ({label})")))?;

    match format {
        FormatTag::Pdf if !bytes.starts_with(PDF_MAGIC) => {
            Err(IngestError::parse(label, "file does not start with a %PDF header"))
        }
        FormatTag::WordProcessor | FormatTag::SlideDeck if !bytes.starts_with(ZIP_MAGIC) => {
            Err(IngestError::parse(label, "office document is not a zip container"))
        }
        _ => Ok(format),
    }
}

fn sniff_format(label: &str, bytes: &[u8]) -> Result<FormatTag, IngestError> {
    if bytes.starts_with(PDF_MAGIC) {
        return Ok(FormatTag::Pdf);
    }

    if bytes.starts_with(ZIP_MAGIC) {
        let archive = zip::ZipArchive::new(Cursor::new(bytes))
            .map_err(|error| IngestError::parse(label, error))?;
        let names = archive.file_names().collect::<Vec<_>>();
        if names.iter().any(|name| *name == "word/document.xml") {
            return Ok(FormatTag::WordProcessor);
        }
        if names.iter().any(|name| name.starts_with("ppt/slides/")) {
            return Ok(FormatTag::SlideDeck);
        }
        if names.iter().any(|name| name.starts_with("xl/")) {
            return Ok(FormatTag::Spreadsheet);
        }
        return Err(IngestError::UnsupportedFormat(format!(
            "zip archive without office content ({label})"
        )));
    }

    match std::str::from_utf8(bytes) {
        Ok(text) if !text.contains('\0') => Ok(FormatTag::PlainText),
        _ => Err(IngestError::UnsupportedFormat(format!(
            "unrecognized binary content ({label})"
        ))),
    }
}

fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.trim_start_matches('\u{feff}').to_string(),
        // Latin-1 maps every byte to the code point of the same value.
        Err(_) => bytes.iter().map(|&byte| byte as char).collect(),
    }
}

fn extract_plain_text(bytes: &[u8]) -> Vec<ExtractedSection> {
    vec![ExtractedSection {
        locator: None,
        text: normalize_paragraphs(&decode_text(bytes)),
    }]
}

fn extract_pdf(label: &str, bytes: &[u8]) -> Result<Vec<ExtractedSection>, IngestError> {
    let document =
        lopdf::Document::load_mem(bytes).map_err(|error| IngestError::parse(label, error))?;

    let mut sections = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        let text = document
            .extract_text(&[page_no])
            .map_err(|error| IngestError::parse(label, error))?;
        let text = normalize_paragraphs(&text);

        if !text.is_empty() {
            sections.push(ExtractedSection {
                locator: Some(Locator::Page { number: page_no }),
                text,
            });
        }
    }

    Ok(sections)
}

fn docx_paragraph_text(paragraph: &docx_rs::Paragraph) -> String {
    let mut text = String::new();
    for child in &paragraph.children {
        if let docx_rs::ParagraphChild::Run(run) = child {
            for run_child in &run.children {
                if let docx_rs::RunChild::Text(t) = run_child {
                    text.push_str(&t.text);
                }
            }
        }
    }
    text
}

fn extract_docx(label: &str, bytes: &[u8]) -> Result<Vec<ExtractedSection>, IngestError> {
    let docx = docx_rs::read_docx(bytes).map_err(|error| IngestError::parse(label, error))?;

    let paragraphs = docx
        .document
        .children
        .iter()
        .filter_map(|child| match child {
            docx_rs::DocumentChild::Paragraph(paragraph) => Some(docx_paragraph_text(paragraph)),
            _ => None,
        })
        .collect::<Vec<_>>();

    Ok(vec![ExtractedSection {
        locator: None,
        text: normalize_paragraphs(&paragraphs.join("\n\n")),
    }])
}

/// Zero-based column index to spreadsheet letters (0 -> A, 27 -> AB).
pub fn column_name(mut column: u32) -> String {
    let mut name = Vec::new();
    loop {
        name.push(b'A' + (column % 26) as u8);
        if column < 26 {
            break;
        }
        column = column / 26 - 1;
    }
    name.reverse();
    String::from_utf8_lossy(&name).into_owned()
}

fn cell_text(cell: &calamine::Data) -> String {
    match cell {
        calamine::Data::Empty => String::new(),
        calamine::Data::String(s) => s.trim().to_string(),
        calamine::Data::Float(f) => f.to_string(),
        calamine::Data::Int(i) => i.to_string(),
        calamine::Data::Bool(b) => b.to_string(),
        calamine::Data::DateTime(dt) => dt.to_string(),
        calamine::Data::DateTimeIso(s) | calamine::Data::DurationIso(s) => s.clone(),
        _ => String::new(),
    }
}

fn extract_spreadsheet(label: &str, bytes: &[u8]) -> Result<Vec<ExtractedSection>, IngestError> {
    let mut workbook = calamine::open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|error| IngestError::parse(label, error))?;

    let mut sections = Vec::new();
    for sheet_name in workbook.sheet_names().to_vec() {
        let range = workbook
            .worksheet_range(&sheet_name)
            .map_err(|error| IngestError::parse(label, error))?;
        let (Some((first_row, first_col)), Some((_, last_col))) = (range.start(), range.end())
        else {
            continue;
        };

        let rows = range
            .rows()
            .map(|row| row.iter().map(cell_text).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        let header = rows
            .first()
            .map(|cells| {
                cells
                    .iter()
                    .filter(|cell| !cell.is_empty())
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();

        for (block_index, block) in rows.chunks(ROWS_PER_SECTION).enumerate() {
            let block_first = first_row as usize + block_index * ROWS_PER_SECTION;
            let mut text = format!("Sheet: {sheet_name}\n");
            if block_index > 0 && !header.is_empty() {
                text.push_str(&format!("Headers: {header}\n"));
            }
            for (offset, cells) in block.iter().enumerate() {
                let values = cells
                    .iter()
                    .filter(|cell| !cell.is_empty())
                    .cloned()
                    .collect::<Vec<_>>();
                if !values.is_empty() {
                    text.push_str(&format!(
                        "Row {}: {}\n",
                        block_first + offset + 1,
                        values.join(" | ")
                    ));
                }
            }

            let range = format!(
                "{}{}:{}{}",
                column_name(first_col),
                block_first + 1,
                column_name(last_col),
                block_first + block.len()
            );
            let text = normalize_lines(&text);
            if text.lines().count() > 1 {
                sections.push(ExtractedSection {
                    locator: Some(Locator::Sheet {
                        name: sheet_name.clone(),
                        range,
                    }),
                    text,
                });
            }
        }
    }

    Ok(sections)
}

fn sniff_delimiter(text: &str) -> u8 {
    let first_line = text.lines().next().unwrap_or_default();
    let mut best = (b',', 0);
    for delimiter in [b',', b';', b'\t', b'|'] {
        let count = first_line.bytes().filter(|byte| *byte == delimiter).count();
        if count > best.1 {
            best = (delimiter, count);
        }
    }
    best.0
}

fn extract_delimited(label: &str, bytes: &[u8]) -> Result<Vec<ExtractedSection>, IngestError> {
    let text = decode_text(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(sniff_delimiter(&text))
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|error| IngestError::parse(label, error))?
        .iter()
        .map(|cell| cell.trim().to_string())
        .filter(|cell| !cell.is_empty())
        .collect::<Vec<_>>()
        .join(", ");

    let records = reader
        .records()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| IngestError::parse(label, error))?;

    let mut sections = Vec::new();
    for (block_index, block) in records.chunks(ROWS_PER_SECTION).enumerate() {
        // Line 1 holds the headers.
        let first_line = 2 + block_index * ROWS_PER_SECTION;
        let mut text = String::new();
        if !headers.is_empty() {
            text.push_str(&format!("Headers: {headers}\n"));
        }
        for (offset, record) in block.iter().enumerate() {
            let values = record
                .iter()
                .map(str::trim)
                .filter(|cell| !cell.is_empty())
                .collect::<Vec<_>>();
            if !values.is_empty() {
                text.push_str(&format!("Row {}: {}\n", first_line + offset, values.join(" | ")));
            }
        }

        sections.push(ExtractedSection {
            locator: Some(Locator::Rows {
                start: first_line as u64,
                end: (first_line + block.len() - 1) as u64,
            }),
            text: normalize_lines(&text),
        });
    }

    if sections.is_empty() && !headers.is_empty() {
        sections.push(ExtractedSection {
            locator: Some(Locator::Rows { start: 1, end: 1 }),
            text: format!("Headers: {headers}"),
        });
    }

    Ok(sections)
}

fn read_zip_entry(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    label: &str,
    name: &str,
) -> Result<String, IngestError> {
    let entry = archive
        .by_name(name)
        .map_err(|error| IngestError::parse(label, error))?;
    let mut out = String::new();
    entry
        .take(MAX_ZIP_ENTRY_BYTES)
        .read_to_string(&mut out)
        .map_err(|error| IngestError::parse(label, error))?;
    if out.len() as u64 >= MAX_ZIP_ENTRY_BYTES {
        return Err(IngestError::parse(
            label,
            format!("zip entry {name} exceeds {MAX_ZIP_ENTRY_BYTES} bytes"),
        ));
    }
    Ok(out)
}

fn slide_number(name: &str) -> Option<u32> {
    name.strip_prefix("ppt/slides/slide")?
        .strip_suffix(".xml")?
        .parse()
        .ok()
}

fn slide_text(label: &str, xml: &str) -> Result<String, IngestError> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut text = String::new();
    let mut in_text = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) if element.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(content)) if in_text => {
                let unescaped = content
                    .unescape()
                    .map_err(|error| IngestError::parse(label, error))?;
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push(' ');
                }
                text.push_str(unescaped.trim());
            }
            Ok(Event::End(element)) => match element.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" if !text.is_empty() && !text.ends_with('\n') => text.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(error) => return Err(IngestError::parse(label, error)),
            _ => {}
        }
    }

    Ok(normalize_lines(&text))
}

fn extract_pptx(label: &str, bytes: &[u8]) -> Result<Vec<ExtractedSection>, IngestError> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|error| IngestError::parse(label, error))?;

    let mut slides = archive
        .file_names()
        .filter_map(|name| slide_number(name).map(|number| (number, name.to_string())))
        .collect::<Vec<_>>();
    slides.sort_unstable();

    let mut sections = Vec::new();
    for (number, name) in slides {
        let xml = read_zip_entry(&mut archive, label, &name)?;
        let text = slide_text(label, &xml)?;
        if !text.is_empty() {
            sections.push(ExtractedSection {
                locator: Some(Locator::Slide { number }),
                text,
            });
        }
    }

    Ok(sections)
}
