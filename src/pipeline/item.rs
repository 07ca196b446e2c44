// src/pipeline/item.rs
use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Default text form for DateTime values that carry no explicit format
pub const DEFAULT_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y%m%d"];

/// Declared type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum ItemType {
    #[default]
    String,
    Int,
    Decimal,
    Bool,
    DateTime,
    Void,
}

impl ItemType {
    pub fn name(&self) -> &'static str {
        match self {
            ItemType::String => "String",
            ItemType::Int => "Int",
            ItemType::Decimal => "Decimal",
            ItemType::Bool => "Bool",
            ItemType::DateTime => "DateTime",
            ItemType::Void => "Void",
        }
    }

    /// Value used when text cannot be parsed as this type
    pub fn zero_value(&self) -> ItemValue {
        match self {
            ItemType::String => ItemValue::String(String::new()),
            ItemType::Int => ItemValue::Int(0),
            ItemType::Decimal => ItemValue::Decimal(0.0),
            ItemType::Bool => ItemValue::Bool(false),
            ItemType::DateTime => ItemValue::DateTime(NaiveDateTime::default()),
            ItemType::Void => ItemValue::Void,
        }
    }
}

impl FromStr for ItemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "s" | "str" | "string" => Ok(ItemType::String),
            "i" | "int" | "integer" => Ok(ItemType::Int),
            "m" | "dec" | "decimal" => Ok(ItemType::Decimal),
            "b" | "bool" | "boolean" => Ok(ItemType::Bool),
            "d" | "date" | "datetime" => Ok(ItemType::DateTime),
            "v" | "void" => Ok(ItemType::Void),
            other => Err(format!("unknown item type '{}'", other)),
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value held by an item.
///
/// `Void` means "no such item" and is what lookups of a missing key return;
/// `Null` is a present item without a value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ItemValue {
    #[default]
    Void,
    Null,
    String(String),
    Int(i64),
    Decimal(f64),
    Bool(bool),
    DateTime(NaiveDateTime),
}

impl ItemValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ItemValue::Void => "Void",
            ItemValue::Null => "Null",
            ItemValue::String(_) => "String",
            ItemValue::Int(_) => "Int",
            ItemValue::Decimal(_) => "Decimal",
            ItemValue::Bool(_) => "Bool",
            ItemValue::DateTime(_) => "DateTime",
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, ItemValue::Void)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ItemValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ItemValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ItemValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Decimal view; Int values widen
    pub fn as_decimal(&self) -> Option<f64> {
        match self {
            ItemValue::Decimal(d) => Some(*d),
            ItemValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ItemValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            ItemValue::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    /// Infer a value from a literal: `"quoted"` is a String, then Bool, Int,
    /// Decimal and DateTime are tried in turn, anything else stays a String.
    pub fn infer(literal: &str) -> ItemValue {
        let trimmed = literal.trim();
        if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
            return ItemValue::String(trimmed[1..trimmed.len() - 1].to_string());
        }
        match trimmed {
            "true" | "True" | "TRUE" => return ItemValue::Bool(true),
            "false" | "False" | "FALSE" => return ItemValue::Bool(false),
            _ => {}
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return ItemValue::Int(i);
        }
        if trimmed.contains('.') {
            if let Ok(d) = trimmed.parse::<f64>() {
                return ItemValue::Decimal(d);
            }
        }
        if let Some(dt) = parse_datetime_strict(trimmed) {
            return ItemValue::DateTime(dt);
        }
        ItemValue::String(trimmed.to_string())
    }
}

impl fmt::Display for ItemValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemValue::Void | ItemValue::Null => Ok(()),
            ItemValue::String(s) => f.write_str(s),
            ItemValue::Int(i) => write!(f, "{}", i),
            ItemValue::Decimal(d) => write!(f, "{}", d),
            ItemValue::Bool(b) => write!(f, "{}", b),
            ItemValue::DateTime(dt) => write!(f, "{}", dt.format(DEFAULT_DATETIME_FORMAT)),
        }
    }
}

impl From<&str> for ItemValue {
    fn from(s: &str) -> Self {
        ItemValue::String(s.to_string())
    }
}

impl From<String> for ItemValue {
    fn from(s: String) -> Self {
        ItemValue::String(s)
    }
}

impl From<i64> for ItemValue {
    fn from(i: i64) -> Self {
        ItemValue::Int(i)
    }
}

impl From<f64> for ItemValue {
    fn from(d: f64) -> Self {
        ItemValue::Decimal(d)
    }
}

impl From<bool> for ItemValue {
    fn from(b: bool) -> Self {
        ItemValue::Bool(b)
    }
}

impl From<NaiveDateTime> for ItemValue {
    fn from(dt: NaiveDateTime) -> Self {
        ItemValue::DateTime(dt)
    }
}

/// Custom text-to-value conversion; `None` falls back to the type's zero value
pub type ItemParser = Arc<dyn Fn(&str) -> Option<ItemValue> + Send + Sync>;

/// Parse and format rules for one field
#[derive(Clone, Default)]
pub struct ItemDef {
    pub item_type: ItemType,
    pub format: Option<String>,
    pub parser: Option<ItemParser>,
}

impl fmt::Debug for ItemDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemDef")
            .field("item_type", &self.item_type)
            .field("format", &self.format)
            .field("parser", &self.parser.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl PartialEq for ItemDef {
    fn eq(&self, other: &Self) -> bool {
        self.item_type == other.item_type
            && self.format == other.format
            && self.parser.is_none()
            && other.parser.is_none()
    }
}

impl ItemDef {
    pub fn new(item_type: ItemType) -> Self {
        ItemDef {
            item_type,
            format: None,
            parser: None,
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_parser(mut self, parser: ItemParser) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Convert text to a value of this type. Never fails: text that does not
    /// fit the type (including empty text) yields the zero value.
    pub fn parse(&self, text: &str) -> ItemValue {
        if let Some(parser) = &self.parser {
            return parser(text).unwrap_or_else(|| self.item_type.zero_value());
        }

        let trimmed = text.trim();
        let parsed = match self.item_type {
            ItemType::String => return ItemValue::String(text.to_string()),
            ItemType::Void => return ItemValue::Void,
            ItemType::Int => trimmed.parse::<i64>().ok().map(ItemValue::Int),
            ItemType::Decimal => trimmed.parse::<f64>().ok().map(ItemValue::Decimal),
            ItemType::Bool => parse_bool(trimmed, self.format.as_deref()).map(ItemValue::Bool),
            ItemType::DateTime => {
                let dt = match &self.format {
                    Some(fmt) => parse_datetime_with_format(trimmed, fmt),
                    None => parse_datetime(trimmed),
                };
                dt.map(ItemValue::DateTime)
            }
        };
        parsed.unwrap_or_else(|| self.item_type.zero_value())
    }

    /// Render a value using this definition's format
    pub fn format_value(&self, value: &ItemValue) -> String {
        let Some(fmt) = self.format.as_deref() else {
            return value.to_string();
        };
        match value {
            ItemValue::Int(i) if !fmt.is_empty() && fmt.chars().all(|c| c == '0') => {
                format!("{:0width$}", i, width = fmt.len())
            }
            ItemValue::Decimal(d) => match fmt.split_once('.') {
                Some((_, fraction)) => format!("{:.*}", fraction.len(), d),
                None => format!("{:.0}", d),
            },
            ItemValue::DateTime(dt) => dt.format(fmt).to_string(),
            ItemValue::Bool(b) => match fmt.split_once('/') {
                Some((yes, no)) => (if *b { yes } else { no }).to_string(),
                None => b.to_string(),
            },
            other => other.to_string(),
        }
    }
}

fn parse_bool(text: &str, format: Option<&str>) -> Option<bool> {
    if let Some((yes, no)) = format.and_then(|f| f.split_once('/')) {
        if text.eq_ignore_ascii_case(yes) {
            return Some(true);
        }
        if text.eq_ignore_ascii_case(no) {
            return Some(false);
        }
    }
    match text.to_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

fn parse_datetime_with_format(text: &str, fmt: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, fmt).ok().or_else(|| {
        NaiveDate::parse_from_str(text, fmt)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
    })
}

fn parse_datetime_strict(text: &str) -> Option<NaiveDateTime> {
    if text.is_empty() {
        return None;
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(text, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

/// Parse a date/time in one of the common layouts, falling back to dateparser
/// for everything else (RFC 2822, offsets, ...). Offsets are normalized to UTC.
pub fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    if let Some(dt) = parse_datetime_strict(text) {
        return Some(dt);
    }
    if text.is_empty() {
        return None;
    }
    dateparser::parse_with_timezone(text, &chrono::Utc)
        .ok()
        .map(|dt| dt.naive_utc())
}

/// One field of a record
#[derive(Debug, Clone)]
pub struct Item {
    key: String,
    value: ItemValue,
    string_value: String,
    def: ItemDef,
}

impl Item {
    /// Build an item from its text form
    pub fn parse(key: impl Into<String>, text: &str, def: ItemDef) -> Self {
        Item {
            key: key.into(),
            value: def.parse(text),
            string_value: text.to_string(),
            def,
        }
    }

    /// Build an item from a value; the text form comes from the definition's format
    pub fn new(key: impl Into<String>, value: ItemValue, def: ItemDef) -> Self {
        let string_value = def.format_value(&value);
        Item {
            key: key.into(),
            value,
            string_value,
            def,
        }
    }

    /// Build an item from an already typed value and the text it came from
    pub fn with_text(key: impl Into<String>, value: ItemValue, text: &str, def: ItemDef) -> Self {
        Item {
            key: key.into(),
            value,
            string_value: text.to_string(),
            def,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &ItemValue {
        &self.value
    }

    /// Text form: the original text for parsed items, the formatted value otherwise
    pub fn string_value(&self) -> &str {
        &self.string_value
    }

    pub fn def(&self) -> &ItemDef {
        &self.def
    }

    pub fn item_type(&self) -> ItemType {
        self.def.item_type
    }

    pub(crate) fn set_value(&mut self, value: ItemValue) {
        self.string_value = self.def.format_value(&value);
        self.value = value;
    }
}
