use crate::error::{ConfigError, ProcessingError};
use crate::formatters::{keys_to_write, quote_value, LineFormatter};
use crate::input_format::separator_byte;
use crate::output_format::OutputSettings;
use crate::pipeline::record::Record;

/// `KEY=VALUE` pairs joined by the output separator, keys carrying the
/// output key prefix
pub struct KeywordFormatter {
    settings: OutputSettings,
    separator: u8,
}

impl KeywordFormatter {
    pub fn new(settings: OutputSettings) -> Result<Self, ConfigError> {
        let separator = separator_byte(settings.separator)?;
        Ok(Self {
            settings,
            separator,
        })
    }

    /// Format a single key=value pair
    pub fn format_key_value_pair(
        &self,
        key: &str,
        text: &str,
        record: &Record,
    ) -> Result<String, ProcessingError> {
        let value = quote_value(
            text,
            record.get(key),
            self.separator,
            self.settings.quotation_mode,
        )?;
        Ok(format!("{}{}={}", self.settings.key_prefix, key, value))
    }
}

impl LineFormatter for KeywordFormatter {
    fn format(&self, record: &Record, fields: &[String]) -> anyhow::Result<String> {
        let pairs = keys_to_write(record, fields, self.settings.exclude_extraneous_fields)
            .into_iter()
            .map(|key| self.format_key_value_pair(key, record.get_str(key), record))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pairs.join(&self.settings.separator.to_string()))
    }
}
