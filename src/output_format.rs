use crate::error::ConfigError;
use crate::formatters::delimited::DelimitedFormatter;
use crate::formatters::flat::FlatFormatter;
use crate::formatters::json::JsonFormatter;
use crate::formatters::keyword::KeywordFormatter;
use crate::formatters::LineFormatter;
use crate::input_format::FieldSpec;
use crate::pipeline::config::{PipelineConfig, QuotationMode};
use crate::pipeline::record::Record;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
pub enum OutputFormat {
    #[value(name = "raw", help = "First output field as the whole line")]
    Raw,
    #[default]
    #[value(name = "delimited", help = "Separator-delimited values")]
    Delimited,
    #[value(name = "keyword", help = "KEY=VALUE pairs")]
    Keyword,
    #[value(name = "flat", help = "Fixed-width columns")]
    Flat,
    #[value(name = "jsonl", help = "JSON Lines format (one JSON object per line)")]
    Jsonl,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "raw" => Ok(OutputFormat::Raw),
            "delimited" | "csv" => Ok(OutputFormat::Delimited),
            "keyword" | "kw" => Ok(OutputFormat::Keyword),
            "flat" => Ok(OutputFormat::Flat),
            "jsonl" | "json" => Ok(OutputFormat::Jsonl),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

/// Options shared by the formatters
#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub separator: char,
    pub key_prefix: String,
    pub quotation_mode: QuotationMode,
    pub exclude_extraneous_fields: bool,
}

impl Default for OutputSettings {
    fn default() -> Self {
        OutputSettings {
            separator: ',',
            key_prefix: String::new(),
            quotation_mode: QuotationMode::default(),
            exclude_extraneous_fields: false,
        }
    }
}

impl OutputSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        OutputSettings {
            separator: config.output_field_separator,
            key_prefix: config.output_key_prefix.clone(),
            quotation_mode: config.quotation_mode,
            exclude_extraneous_fields: config.exclude_extraneous_fields,
        }
    }
}

/// Whole line from the first output field the record has
struct RawFormatter;

impl LineFormatter for RawFormatter {
    fn format(&self, record: &Record, fields: &[String]) -> anyhow::Result<String> {
        let text = fields
            .iter()
            .find_map(|f| record.get_item(f))
            .or_else(|| record.item(0))
            .map(|item| item.string_value().to_string())
            .unwrap_or_default();
        Ok(text)
    }
}

impl OutputFormat {
    pub fn name(&self) -> &'static str {
        match self {
            OutputFormat::Raw => "raw",
            OutputFormat::Delimited => "delimited",
            OutputFormat::Keyword => "keyword",
            OutputFormat::Flat => "flat",
            OutputFormat::Jsonl => "jsonl",
        }
    }

    /// Formats whose lines carry no field names
    pub fn is_positional(&self) -> bool {
        matches!(self, OutputFormat::Delimited | OutputFormat::Flat)
    }

    pub fn create_formatter(
        &self,
        config: &PipelineConfig,
    ) -> Result<Box<dyn LineFormatter>, ConfigError> {
        let settings = OutputSettings::from_config(config);
        let formatter: Box<dyn LineFormatter> = match self {
            OutputFormat::Raw => Box::new(RawFormatter),
            OutputFormat::Delimited => Box::new(DelimitedFormatter::new(settings)?),
            OutputFormat::Keyword => Box::new(KeywordFormatter::new(settings)?),
            OutputFormat::Flat => Box::new(FlatFormatter::new(FieldSpec::parse_list(
                &config.output_fields,
            )?)),
            OutputFormat::Jsonl => Box::new(JsonFormatter::new(settings)),
        };
        Ok(formatter)
    }
}
