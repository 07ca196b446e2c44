// src/lib.rs
pub mod clustering;
pub mod error;
pub mod flatten;
pub mod formatters;
pub mod input_format;
pub mod output_format;
pub mod pipeline;

pub use error::*;

pub use clustering::{ClusterMarker, Clusterer};
pub use input_format::{InputFormat, LineParser, ParseContext};
pub use output_format::OutputFormat;
pub use pipeline::cluster::Cluster;
pub use pipeline::config::{
    ActionOnDuplicateKey, DeferTransformation, PipelineConfig, QuotationMode, RejectedRecordAction,
};
pub use pipeline::context::{
    CompletionStatus, Counts, ExecutionResult, Phase, PhaseEvent, PhaseStatus, ProgressEvent,
};
pub use pipeline::fault::{FaultOrigin, FaultReport};
pub use pipeline::global_cache::GlobalCache;
pub use pipeline::io::{
    CollectingSink, FnSink, FnSource, IntakeLine, IterSource, LineSink, LineSource, ReaderSource,
    WriterSink,
};
pub use pipeline::item::{Item, ItemDef, ItemType, ItemValue};
pub use pipeline::record::{Record, TraceBin};
pub use pipeline::registry::FieldRegistry;
pub use pipeline::stream::StreamPipeline;
pub use pipeline::transform::{Router, Transformer};
