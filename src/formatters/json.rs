use crate::formatters::{keys_to_write, LineFormatter};
use crate::output_format::OutputSettings;
use crate::pipeline::item::{Item, ItemValue};
use crate::pipeline::record::Record;

/// One compact JSON object per record. Numbers keep the text they were read with.
pub struct JsonFormatter {
    settings: OutputSettings,
}

impl JsonFormatter {
    pub fn new(settings: OutputSettings) -> Self {
        Self { settings }
    }
}

fn value_json(item: &Item) -> anyhow::Result<String> {
    let text = item.string_value();
    let json = match item.value() {
        ItemValue::Int(_) | ItemValue::Decimal(_)
            if serde_json::from_str::<serde_json::Number>(text).is_ok() =>
        {
            text.to_string()
        }
        ItemValue::Int(i) => i.to_string(),
        ItemValue::Decimal(d) => serde_json::Number::from_f64(*d)
            .map(|n| n.to_string())
            .unwrap_or_else(|| "null".to_string()),
        ItemValue::Bool(b) => b.to_string(),
        ItemValue::Null | ItemValue::Void => "null".to_string(),
        ItemValue::String(_) | ItemValue::DateTime(_) => serde_json::to_string(text)?,
    };
    Ok(json)
}

impl LineFormatter for JsonFormatter {
    fn format(&self, record: &Record, fields: &[String]) -> anyhow::Result<String> {
        let mut parts = Vec::new();
        for key in keys_to_write(record, fields, self.settings.exclude_extraneous_fields) {
            if let Some(item) = record.get_item(key) {
                parts.push(format!("{}:{}", serde_json::to_string(key)?, value_json(item)?));
            }
        }
        Ok(format!("{{{}}}", parts.join(",")))
    }
}
