use crate::error::{ConfigError, ProcessingError};
use crate::formatters::{quote_style, quote_value, write_csv_line, LineFormatter};
use crate::input_format::separator_byte;
use crate::output_format::OutputSettings;
use crate::pipeline::config::QuotationMode;
use crate::pipeline::item::ItemValue;
use crate::pipeline::record::Record;

/// Separator-delimited values in the order of the output fields
pub struct DelimitedFormatter {
    separator: u8,
    mode: QuotationMode,
}

impl DelimitedFormatter {
    pub fn new(settings: OutputSettings) -> Result<Self, ConfigError> {
        Ok(Self {
            separator: separator_byte(settings.separator)?,
            mode: settings.quotation_mode,
        })
    }

    fn line(&self, cells: &[(&str, &ItemValue)]) -> Result<String, ProcessingError> {
        if self.mode != QuotationMode::StringsAndDates {
            let texts: Vec<&str> = cells.iter().map(|(text, _)| *text).collect();
            return write_csv_line(&texts, self.separator, quote_style(self.mode, &ItemValue::Null));
        }
        // quoting depends on each value's type
        let quoted = cells
            .iter()
            .map(|(text, value)| quote_value(text, value, self.separator, self.mode))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(quoted.join(&char::from(self.separator).to_string()))
    }
}

impl LineFormatter for DelimitedFormatter {
    fn format(&self, record: &Record, fields: &[String]) -> anyhow::Result<String> {
        let null = ItemValue::Null;
        let cells: Vec<(&str, &ItemValue)> = fields
            .iter()
            .map(|field| match record.get_item(field) {
                Some(item) => (item.string_value(), item.value()),
                None => ("", &null),
            })
            .collect();
        Ok(self.line(&cells)?)
    }

    fn header(&self, fields: &[String]) -> Option<String> {
        let name = ItemValue::String(String::new());
        let cells: Vec<(&str, &ItemValue)> = fields.iter().map(|f| (f.as_str(), &name)).collect();
        self.line(&cells).ok()
    }
}
