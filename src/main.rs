use anyhow::Context;
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{BufReader, BufWriter};
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use linewright::pipeline::io::{BoxedReader, BoxedWriter};
use linewright::{
    clustering, InputFormat, OutputFormat, PipelineConfig, ReaderSource, Router, StreamPipeline,
    WriterSink,
};

#[derive(Parser)]
#[command(name = "linewright")]
#[command(about = "Convert line-oriented data between formats")]
#[command(version)]
struct Args {
    /// Input files, read in order as sources 1, 2, ... (default: stdin)
    #[arg(short = 'i', long = "input", action = ArgAction::Append)]
    input_files: Vec<PathBuf>,

    /// Output files for targets 1, 2, ... (default: stdout)
    #[arg(short = 'o', long = "output", action = ArgAction::Append)]
    output_files: Vec<PathBuf>,

    /// YAML file with pipeline settings; options below override it
    #[arg(long = "config", value_name = "FILE")]
    config_file: Option<PathBuf>,

    #[arg(long, value_enum)]
    input_format: Option<InputFormat>,

    #[arg(long, value_enum)]
    output_format: Option<OutputFormat>,

    /// First line of every input is a header
    #[arg(long)]
    headers: bool,

    /// Write a header line first to every output
    #[arg(long)]
    output_headers: bool,

    /// Input field names (`name|width` for flat input)
    #[arg(long, value_delimiter = ',')]
    fields: Vec<String>,

    /// Output field names (`name|width` for flat output)
    #[arg(long, value_delimiter = ',')]
    output_fields: Vec<String>,

    /// Field types, e.g. `AMT|M,DOB|D|%Y%m%d`
    #[arg(long, value_name = "DEFS")]
    types: Option<String>,

    /// Accept fields not listed in --fields
    #[arg(long)]
    on_the_fly: bool,

    /// Start a new cluster at records where FIELD matches REGEX
    #[arg(long, value_name = "FIELD=REGEX")]
    cluster_on: Option<String>,

    /// A matching record ends its cluster instead of starting one
    #[arg(long)]
    marker_ends_cluster: bool,

    /// Write records from input N to output N
    #[arg(long)]
    route_by_source: bool,

    /// Queue capacity between stages (default: unbounded)
    #[arg(long, value_name = "N")]
    buffer_size: Option<usize>,

    /// Transformation jobs running at once
    #[arg(long, value_name = "N")]
    concurrency: Option<usize>,

    /// Stop after reading N records
    #[arg(long, value_name = "N")]
    limit: Option<usize>,

    /// Stop reading after this long, e.g. `30s` or `5m`
    #[arg(long, value_parser = humantime::parse_duration)]
    time_limit: Option<Duration>,

    /// Debug mode - log processing details
    #[arg(long)]
    debug: bool,

    /// Write the log here instead of stderr
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

impl Args {
    fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        let mut config = match &self.config_file {
            Some(path) => PipelineConfig::from_yaml_file(path)
                .with_context(|| format!("Failed to load config '{}'", path.display()))?,
            None => PipelineConfig::default(),
        };

        if let Some(format) = self.input_format {
            config.input_format = format;
        }
        if let Some(format) = self.output_format {
            config.output_format = format;
        }
        if !self.fields.is_empty() {
            config.input_fields = self.fields.clone();
        }
        if !self.output_fields.is_empty() {
            config.output_fields = self.output_fields.clone();
        }
        if let Some(types) = &self.types {
            config.explicit_type_definitions = types.clone();
        }
        config.headers_in_first_input_row |= self.headers;
        config.headers_in_first_output_row |= self.output_headers;
        config.allow_on_the_fly_input_fields |= self.on_the_fly || config.input_fields.is_empty();
        if self.marker_ends_cluster {
            config.marker_starts_cluster = false;
        }
        if self.buffer_size.is_some() {
            config.buffer_size = self.buffer_size;
        }
        if let Some(level) = self.concurrency {
            config.concurrency_level = level;
        }
        if self.limit.is_some() {
            config.intake_record_limit = self.limit;
        }
        if self.time_limit.is_some() {
            config.time_limit = self.time_limit;
        }
        config.close_logger_on_dispose = true;
        config.validate()?;
        Ok(config)
    }
}

fn init_logging(args: &Args) -> anyhow::Result<WorkerGuard> {
    let (writer, guard) = match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file '{}'", path.display()))?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };
    let filter = if args.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))?;
    Ok(guard)
}

async fn open_inputs(paths: &[PathBuf]) -> anyhow::Result<Vec<BoxedReader>> {
    if paths.is_empty() {
        return Ok(vec![Box::new(BufReader::new(tokio::io::stdin()))]);
    }
    let mut readers: Vec<BoxedReader> = Vec::with_capacity(paths.len());
    for path in paths {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open input file '{}'", path.display()))?;
        readers.push(Box::new(BufReader::new(file)));
    }
    Ok(readers)
}

async fn open_outputs(paths: &[PathBuf]) -> anyhow::Result<Vec<BoxedWriter>> {
    if paths.is_empty() {
        return Ok(vec![Box::new(BufWriter::new(tokio::io::stdout()))]);
    }
    let mut writers: Vec<BoxedWriter> = Vec::with_capacity(paths.len());
    for path in paths {
        let file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("Failed to create output file '{}'", path.display()))?;
        writers.push(Box::new(BufWriter::new(file)));
    }
    Ok(writers)
}

/// Exit code: 0 when lines were written, 2 when nothing was, 1 on failure
async fn run(args: Args, guard: WorkerGuard) -> anyhow::Result<i32> {
    let config = args.pipeline_config()?;
    let readers = open_inputs(&args.input_files).await?;
    let writers = open_outputs(&args.output_files).await?;

    let mut pipeline = StreamPipeline::new(config, ReaderSource::new(readers), WriterSink::new(writers))
        .context("Invalid pipeline configuration")?
        .with_log_guard(guard)
        .with_error_handler(|report| eprintln!("linewright: {}", report));
    if let Some(spec) = &args.cluster_on {
        let marker = clustering::parse_cluster_on(spec)
            .map_err(|e| anyhow::anyhow!("Invalid --cluster-on: {}", e))?;
        pipeline = pipeline.with_cluster_marker(marker);
    }
    if args.route_by_source {
        pipeline = pipeline.with_router(Router::source_to_target());
    }

    let result = pipeline.execute().await;
    debug!(
        status = %result.completion_status,
        rows_read = result.rows_read,
        rows_written = result.rows_written,
        "Done"
    );
    pipeline.dispose();

    let code = if !result.completion_status.is_success() {
        1
    } else if result.rows_written == 0 {
        2
    } else {
        0
    };
    Ok(code)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let guard = match init_logging(&args) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    let code = match run(args, guard).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}
