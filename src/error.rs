#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Parse error ({format}) at line {line}: {message}")]
    ParseError {
        format: &'static str,
        line: usize,
        message: String,
    },

    #[error("Format error ({format}): {message}")]
    FormatError {
        format: &'static str,
        message: String,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid type definition '{spec}': {reason}")]
    InvalidTypeDefinition { spec: String, reason: String },

    #[error("Invalid field specification '{0}'")]
    InvalidFieldSpec(String),

    #[error("Invalid global cache element '{0}'")]
    InvalidCacheElement(String),

    #[error("Duplicate global cache key '{0}'")]
    DuplicateCacheKey(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CacheError {
    #[error("Global cache has no element with key '{0}'")]
    MissingKey(String),

    #[error("Global cache element '{key}' holds {actual}, not an Int")]
    NotAnInt { key: String, actual: &'static str },

    #[error("Global cache element '{0}' overflowed")]
    Overflow(String),
}
