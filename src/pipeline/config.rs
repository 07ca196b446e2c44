use crate::error::ConfigError;
use crate::input_format::InputFormat;
use crate::output_format::OutputFormat;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Configuration for pipeline behavior
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // intake
    pub input_format: InputFormat,
    /// Field names, or `name|width` entries for the Flat format
    pub input_fields: Vec<String>,
    pub headers_in_first_input_row: bool,
    pub allow_on_the_fly_input_fields: bool,
    /// `name|Type[|Format]` entries separated by commas
    pub explicit_type_definitions: String,
    pub action_on_duplicate_key: ActionOnDuplicateKey,
    pub input_field_separator: char,
    pub input_key_prefix: String,
    pub exclude_items_missing_prefix: bool,
    pub trim_input_values: bool,
    pub retain_quotes: bool,
    pub intake_record_limit: Option<usize>,
    #[serde(with = "humantime_serde_opt")]
    pub time_limit: Option<Duration>,
    pub rejected_record_action: RejectedRecordAction,

    // clustering and transformation
    pub marker_starts_cluster: bool,
    pub defer_transformation: DeferTransformation,
    pub concurrency_level: usize,

    // output
    pub output_format: OutputFormat,
    pub output_fields: Vec<String>,
    pub headers_in_first_output_row: bool,
    pub output_field_separator: char,
    pub output_key_prefix: String,
    pub quotation_mode: QuotationMode,
    pub exclude_extraneous_fields: bool,

    // stages
    /// Base queue capacity; `None` leaves the queues unbounded
    pub buffer_size: Option<usize>,
    pub intake_buffer_factor: f64,
    pub transform_buffer_factor: f64,
    pub output_buffer_factor: f64,

    // lifecycle
    pub eager_initialization: bool,
    pub close_logger_on_dispose: bool,
    /// Report progress every N clusters written; 0 disables
    pub progress_interval: usize,
    /// `Name|Literal` or `Name` entries
    pub global_cache_elements: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            input_format: InputFormat::default(),
            input_fields: Vec::new(),
            headers_in_first_input_row: false,
            allow_on_the_fly_input_fields: false,
            explicit_type_definitions: String::new(),
            action_on_duplicate_key: ActionOnDuplicateKey::default(),
            input_field_separator: ',',
            input_key_prefix: String::new(),
            exclude_items_missing_prefix: false,
            trim_input_values: false,
            retain_quotes: false,
            intake_record_limit: None,
            time_limit: None,
            rejected_record_action: RejectedRecordAction::default(),
            marker_starts_cluster: true,
            defer_transformation: DeferTransformation::default(),
            concurrency_level: 1,
            output_format: OutputFormat::default(),
            output_fields: Vec::new(),
            headers_in_first_output_row: false,
            output_field_separator: ',',
            output_key_prefix: String::new(),
            quotation_mode: QuotationMode::default(),
            exclude_extraneous_fields: false,
            buffer_size: None,
            intake_buffer_factor: 1.5,
            transform_buffer_factor: 1.0,
            output_buffer_factor: 1.5,
            eager_initialization: false,
            close_logger_on_dispose: false,
            progress_interval: 0, // Disabled
            global_cache_elements: Vec::new(),
        }
    }
}

/// Largest capacity a tokio queue accepts
pub const MAX_STAGE_CAPACITY: usize = usize::MAX >> 3;

impl PipelineConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_level == 0 {
            return Err(ConfigError::Invalid(
                "concurrency_level must be at least 1".to_string(),
            ));
        }
        for (name, factor) in [
            ("intake_buffer_factor", self.intake_buffer_factor),
            ("transform_buffer_factor", self.transform_buffer_factor),
            ("output_buffer_factor", self.output_buffer_factor),
        ] {
            if !factor.is_finite() || factor <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a positive finite number",
                    name
                )));
            }
            if let Some(size) = self.buffer_size {
                if size as f64 * factor >= MAX_STAGE_CAPACITY as f64 {
                    return Err(ConfigError::Invalid(format!(
                        "buffer_size {} times {} {} exceeds the largest queue capacity {}",
                        size, name, factor, MAX_STAGE_CAPACITY
                    )));
                }
            }
        }
        Ok(())
    }

    /// Queue capacity for a stage: `buffer_size × factor`, at least 1
    pub fn stage_capacity(&self, factor: f64) -> Option<usize> {
        self.buffer_size
            .map(|size| ((size as f64 * factor).round() as usize).max(1))
    }
}

/// What to do with a key that already exists in the record being built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum ActionOnDuplicateKey {
    /// Keep the first occurrence
    #[default]
    IgnoreItem,
    /// Later value wins, at the position of the first
    ReplaceItem,
    /// Keep both; the later one gets a fresh default name
    AssignDefaultKey,
    /// Drop the whole record
    ExcludeRecord,
}

/// When clusters are handed to the transformation stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum DeferTransformation {
    #[default]
    NotDeferred,
    UntilClusteringCompleted,
    /// Clusters go to `StreamPipeline::deferred_clusters` and are never transformed
    Indefinitely,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum QuotationMode {
    #[default]
    OnlyIfNeeded,
    Always,
    StringsAndDates,
}

/// Effect of a record initiator returning false
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum RejectedRecordAction {
    #[default]
    Exclude,
    Retain,
}

mod humantime_serde_opt {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => humantime::parse_duration(&text)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
