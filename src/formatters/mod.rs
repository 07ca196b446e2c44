use crate::error::ProcessingError;
use crate::pipeline::config::QuotationMode;
use crate::pipeline::item::ItemValue;
use crate::pipeline::record::Record;
use csv::QuoteStyle;

/// Turns records back into lines
pub trait LineFormatter: Send + Sync {
    /// One output line; `fields` lists the output field names in order
    fn format(&self, record: &Record, fields: &[String]) -> anyhow::Result<String>;

    /// Header line written first to every target, if the format has one
    fn header(&self, _fields: &[String]) -> Option<String> {
        None
    }
}

/// csv quoting style for one value under the configured mode
pub fn quote_style(mode: QuotationMode, value: &ItemValue) -> QuoteStyle {
    match mode {
        QuotationMode::OnlyIfNeeded => QuoteStyle::Necessary,
        QuotationMode::Always => QuoteStyle::Always,
        QuotationMode::StringsAndDates => match value {
            ItemValue::String(_) | ItemValue::DateTime(_) => QuoteStyle::Always,
            _ => QuoteStyle::Necessary,
        },
    }
}

/// One separator-delimited line, quoted by the csv writer
pub fn write_csv_line<T: AsRef<[u8]>>(
    cells: &[T],
    separator: u8,
    style: QuoteStyle,
) -> Result<String, ProcessingError> {
    // csv quotes a lone empty field so the row is not mistaken for a blank line
    if let ([only], QuoteStyle::Necessary) = (cells, style) {
        if only.as_ref().is_empty() {
            return Ok(String::new());
        }
    }
    let mut writer = csv::WriterBuilder::new()
        .delimiter(separator)
        .quote_style(style)
        .terminator(csv::Terminator::Any(b'\n'))
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(cells)?;
    let bytes = writer
        .into_inner()
        .map_err(|e| ProcessingError::IoError(e.into_error()))?;
    let mut line = String::from_utf8(bytes).map_err(|e| ProcessingError::FormatError {
        format: "delimited",
        message: e.to_string(),
    })?;
    if line.ends_with('\n') {
        line.pop();
    }
    Ok(line)
}

/// Quote a single value for separator-based output
pub fn quote_value(
    text: &str,
    value: &ItemValue,
    separator: u8,
    mode: QuotationMode,
) -> Result<String, ProcessingError> {
    write_csv_line(&[text], separator, quote_style(mode, value))
}

/// Keys to write for self-describing formats: the listed fields the record
/// has, then (unless excluded) the record's remaining keys
pub fn keys_to_write<'r>(record: &'r Record, fields: &'r [String], exclude_extraneous: bool) -> Vec<&'r str> {
    let mut keys: Vec<&str> = fields
        .iter()
        .map(String::as_str)
        .filter(|f| record.contains_key(f))
        .collect();
    if !exclude_extraneous {
        keys.extend(record.keys().filter(|k| !fields.iter().any(|f| f == k)));
    }
    keys
}

pub mod delimited;
pub mod flat;
pub mod json;
pub mod keyword;
