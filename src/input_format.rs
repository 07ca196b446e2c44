// src/input_format.rs - Line parsers for every intake format

use crate::error::{ConfigError, ProcessingError};
use crate::flatten::scalar_paths;
use crate::pipeline::config::{ActionOnDuplicateKey, PipelineConfig};
use crate::pipeline::item::ItemValue;
use crate::pipeline::record::{Record, RecordBuilder};
use crate::pipeline::registry::FieldRegistry;
use serde::Deserialize;
use serde_json::Value;

/// Column width used when a Flat field gives none
pub const DEFAULT_FLAT_WIDTH: usize = 10;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
pub enum InputFormat {
    /// Whole line is one field
    #[value(name = "raw")]
    Raw,
    #[default]
    #[value(name = "delimited")]
    Delimited,
    /// KEY=VALUE pairs
    #[value(name = "keyword")]
    Keyword,
    /// Fixed-width columns
    #[value(name = "flat")]
    Flat,
    #[value(name = "jsonl")]
    Jsonl,
}

impl InputFormat {
    pub fn name(&self) -> &'static str {
        match self {
            InputFormat::Raw => "raw",
            InputFormat::Delimited => "delimited",
            InputFormat::Keyword => "keyword",
            InputFormat::Flat => "flat",
            InputFormat::Jsonl => "jsonl",
        }
    }

    pub fn create_parser(&self, config: &PipelineConfig) -> Result<Box<dyn LineParser>, ConfigError> {
        let settings = ParserSettings::from_config(config)?;
        let parser: Box<dyn LineParser> = match self {
            InputFormat::Raw => Box::new(RawParser::new(settings)),
            InputFormat::Delimited => Box::new(DelimitedParser::new(settings)),
            InputFormat::Keyword => Box::new(KeywordParser::new(settings)),
            InputFormat::Flat => Box::new(FlatParser::new(settings, &config.input_fields)?),
            InputFormat::Jsonl => Box::new(JsonlParser::new(settings)),
        };
        Ok(parser)
    }
}

impl std::str::FromStr for InputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "raw" => Ok(InputFormat::Raw),
            "delimited" | "csv" => Ok(InputFormat::Delimited),
            "keyword" | "kw" => Ok(InputFormat::Keyword),
            "flat" => Ok(InputFormat::Flat),
            "jsonl" | "json" => Ok(InputFormat::Jsonl),
            _ => Err(format!("Unknown input format: {}", s)),
        }
    }
}

/// A configured field: its name and, for fixed-width formats, its width
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub width: usize,
}

impl FieldSpec {
    /// Parse `name` or `name|width`
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let (name, width) = match spec.split_once('|') {
            Some((name, width)) => {
                let width = width
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| ConfigError::InvalidFieldSpec(spec.to_string()))?;
                (name.trim(), width)
            }
            None => (spec.trim(), DEFAULT_FLAT_WIDTH),
        };
        if name.is_empty() {
            return Err(ConfigError::InvalidFieldSpec(spec.to_string()));
        }
        Ok(FieldSpec {
            name: name.to_string(),
            width,
        })
    }

    pub fn parse_list<S: AsRef<str>>(specs: &[S]) -> Result<Vec<FieldSpec>, ConfigError> {
        specs.iter().map(|s| FieldSpec::parse(s.as_ref())).collect()
    }
}

/// Where a line came from, plus the registry records are built against
pub struct ParseContext<'a> {
    pub registry: &'a FieldRegistry,
    /// Line number across all sources, headers included
    pub line_no: usize,
    pub source_no: usize,
}

/// Turns raw lines into records
pub trait LineParser: Send {
    /// Consume the header line of a source
    fn parse_header(&mut self, _line: &str, _ctx: &ParseContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Records for one line; empty means the line is skipped
    fn parse_line(&mut self, line: &str, ctx: &ParseContext) -> anyhow::Result<Vec<Record>>;
}

/// Options shared by the parsers
#[derive(Debug, Clone)]
pub struct ParserSettings {
    pub separator: u8,
    pub key_prefix: String,
    pub exclude_items_missing_prefix: bool,
    pub trim_values: bool,
    pub retain_quotes: bool,
    pub on_duplicate: ActionOnDuplicateKey,
}

impl ParserSettings {
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        Ok(ParserSettings {
            separator: separator_byte(config.input_field_separator)?,
            key_prefix: config.input_key_prefix.clone(),
            exclude_items_missing_prefix: config.exclude_items_missing_prefix,
            trim_values: config.trim_input_values,
            retain_quotes: config.retain_quotes,
            on_duplicate: config.action_on_duplicate_key,
        })
    }

    fn value<'v>(&self, text: &'v str) -> &'v str {
        if self.trim_values {
            text.trim()
        } else {
            text
        }
    }
}

impl Default for ParserSettings {
    fn default() -> Self {
        ParserSettings {
            separator: b',',
            key_prefix: String::new(),
            exclude_items_missing_prefix: false,
            trim_values: false,
            retain_quotes: false,
            on_duplicate: ActionOnDuplicateKey::default(),
        }
    }
}

pub(crate) fn separator_byte(separator: char) -> Result<u8, ConfigError> {
    if separator.is_ascii() {
        Ok(separator as u8)
    } else {
        Err(ConfigError::Invalid(format!(
            "field separator must be an ASCII character, got '{}'",
            separator
        )))
    }
}

/// Split one line on the separator, honoring double quotes. With
/// `retain_quotes` the quotes stay in the values and do not protect separators.
pub fn split_fields(line: &str, separator: u8, retain_quotes: bool) -> Result<Vec<String>, ProcessingError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(separator)
        .quoting(!retain_quotes)
        .from_reader(line.as_bytes());
    let mut row = csv::StringRecord::new();
    if reader.read_record(&mut row)? {
        Ok(row.iter().map(String::from).collect())
    } else {
        Ok(Vec::new())
    }
}

fn finish(builder: RecordBuilder, ctx: &ParseContext) -> Vec<Record> {
    match builder.build() {
        Some(mut record) => {
            record.set_source_no(ctx.source_no);
            vec![record]
        }
        None => Vec::new(),
    }
}

pub struct RawParser {
    settings: ParserSettings,
}

impl RawParser {
    pub fn new(settings: ParserSettings) -> Self {
        Self { settings }
    }
}

impl LineParser for RawParser {
    fn parse_line(&mut self, line: &str, ctx: &ParseContext) -> anyhow::Result<Vec<Record>> {
        if ctx.registry.is_empty() {
            ctx.registry.declare(&[crate::pipeline::registry::default_field_name(1)]);
        }
        let mut builder = RecordBuilder::new(ctx.registry, self.settings.on_duplicate);
        builder.add_positional(1, self.settings.value(line))?;
        Ok(finish(builder, ctx))
    }
}

/// Separator-delimited values. Columns are named by the source's header
/// row when there is one, by position otherwise.
pub struct DelimitedParser {
    settings: ParserSettings,
    headers: Option<Vec<String>>,
}

impl DelimitedParser {
    pub fn new(settings: ParserSettings) -> Self {
        Self {
            settings,
            headers: None,
        }
    }
}

impl LineParser for DelimitedParser {
    fn parse_header(&mut self, line: &str, ctx: &ParseContext) -> anyhow::Result<()> {
        let cells = split_fields(line, self.settings.separator, false)?;
        self.headers = Some(ctx.registry.header_names(&cells));
        Ok(())
    }

    fn parse_line(&mut self, line: &str, ctx: &ParseContext) -> anyhow::Result<Vec<Record>> {
        if line.is_empty() {
            return Ok(Vec::new());
        }
        let values = split_fields(line, self.settings.separator, self.settings.retain_quotes)?;
        let mut builder = RecordBuilder::new(ctx.registry, self.settings.on_duplicate);
        for (index, value) in values.iter().enumerate() {
            let value = self.settings.value(value);
            match self.headers.as_ref().and_then(|h| h.get(index)) {
                Some(name) => builder.add(name, value)?,
                None => builder.add_positional(index + 1, value)?,
            }
        }
        Ok(finish(builder, ctx))
    }
}

/// `KEY=VALUE` pairs separated by the field separator, keys optionally
/// carrying a prefix such as `@p`
pub struct KeywordParser {
    settings: ParserSettings,
}

impl KeywordParser {
    pub fn new(settings: ParserSettings) -> Self {
        Self { settings }
    }

    /// Key with the prefix removed; `None` when the item must be skipped
    fn key<'k>(&self, raw_key: &'k str) -> Option<&'k str> {
        let raw_key = raw_key.trim();
        if self.settings.key_prefix.is_empty() {
            return Some(raw_key);
        }
        match raw_key.strip_prefix(self.settings.key_prefix.as_str()) {
            Some(key) => Some(key),
            None if self.settings.exclude_items_missing_prefix => None,
            None => Some(raw_key),
        }
    }
}

impl LineParser for KeywordParser {
    fn parse_line(&mut self, line: &str, ctx: &ParseContext) -> anyhow::Result<Vec<Record>> {
        if line.trim().is_empty() {
            return Ok(Vec::new());
        }
        let tokens = split_fields(line, self.settings.separator, self.settings.retain_quotes)?;
        let mut builder = RecordBuilder::new(ctx.registry, self.settings.on_duplicate);
        for token in &tokens {
            match token.split_once('=') {
                Some((raw_key, value)) => {
                    if let Some(key) = self.key(raw_key) {
                        builder.add(key, self.settings.value(value))?;
                    }
                }
                // a bare value gets a default name
                None if !token.trim().is_empty() => builder.add("", self.settings.value(token))?,
                None => {}
            }
        }
        Ok(finish(builder, ctx))
    }
}

/// Fixed-width columns
pub struct FlatParser {
    settings: ParserSettings,
    fields: Vec<FieldSpec>,
}

impl FlatParser {
    pub fn new<S: AsRef<str>>(settings: ParserSettings, specs: &[S]) -> Result<Self, ConfigError> {
        let fields = FieldSpec::parse_list(specs)?;
        if fields.is_empty() {
            return Err(ConfigError::Invalid(
                "the flat format needs input_fields with widths".to_string(),
            ));
        }
        Ok(Self { settings, fields })
    }
}

impl LineParser for FlatParser {
    fn parse_line(&mut self, line: &str, ctx: &ParseContext) -> anyhow::Result<Vec<Record>> {
        if line.is_empty() {
            return Ok(Vec::new());
        }
        let chars: Vec<char> = line.chars().collect();
        let mut builder = RecordBuilder::new(ctx.registry, self.settings.on_duplicate);
        let mut start = 0;
        for field in &self.fields {
            let end = (start + field.width).min(chars.len());
            let text: String = chars.get(start..end).map(|c| c.iter().collect()).unwrap_or_default();
            builder.add(&field.name, self.settings.value(&text))?;
            start = end;
        }
        Ok(finish(builder, ctx))
    }
}

/// One JSON object per line, nested objects flattened to dotted keys.
/// A top-level array yields one record per element, all sharing a
/// pre-assigned cluster number.
pub struct JsonlParser {
    settings: ParserSettings,
    arrays_seen: usize,
}

impl JsonlParser {
    pub fn new(settings: ParserSettings) -> Self {
        Self {
            settings,
            arrays_seen: 0,
        }
    }

    fn record_from(&self, object: &Value, ctx: &ParseContext) -> anyhow::Result<Option<Record>> {
        let mut builder = RecordBuilder::new(ctx.registry, self.settings.on_duplicate);
        for (key, value) in scalar_paths(object) {
            let (text, native) = json_item(value);
            builder.add_native(&key, self.settings.value(&text), native)?;
        }
        Ok(builder.build().map(|mut r| {
            r.set_source_no(ctx.source_no);
            r
        }))
    }
}

/// Text form and typed value of a JSON scalar
fn json_item(value: &Value) -> (String, ItemValue) {
    match value {
        Value::String(s) => (s.clone(), ItemValue::String(s.clone())),
        Value::Number(n) => {
            let text = n.to_string();
            let native = match n.as_i64() {
                Some(i) if !text.contains(['.', 'e', 'E']) => ItemValue::Int(i),
                _ => ItemValue::Decimal(n.as_f64().unwrap_or_default()),
            };
            (text, native)
        }
        Value::Bool(b) => (b.to_string(), ItemValue::Bool(*b)),
        Value::Null => (String::new(), ItemValue::Null),
        // scalar_paths yields only scalars
        other => (other.to_string(), ItemValue::String(other.to_string())),
    }
}

impl LineParser for JsonlParser {
    fn parse_line(&mut self, line: &str, ctx: &ParseContext) -> anyhow::Result<Vec<Record>> {
        if line.trim().is_empty() {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_str(line).map_err(|e| ProcessingError::ParseError {
            format: "jsonl",
            line: ctx.line_no,
            message: e.to_string(),
        })?;
        match &value {
            Value::Object(_) => Ok(self.record_from(&value, ctx)?.into_iter().collect()),
            Value::Array(elements) => {
                self.arrays_seen += 1;
                let clstr_no = self.arrays_seen;
                let mut records = Vec::with_capacity(elements.len());
                for element in elements {
                    if !element.is_object() {
                        return Err(ProcessingError::ParseError {
                            format: "jsonl",
                            line: ctx.line_no,
                            message: "array elements must be objects".to_string(),
                        }
                        .into());
                    }
                    if let Some(record) = self.record_from(element, ctx)? {
                        records.push(record.with_clstr_no(clstr_no));
                    }
                }
                Ok(records)
            }
            _ => Err(ProcessingError::ParseError {
                format: "jsonl",
                line: ctx.line_no,
                message: "expected a JSON object or array".to_string(),
            }
            .into()),
        }
    }
}
