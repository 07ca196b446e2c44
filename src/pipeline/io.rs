use crate::error::ProcessingError;
use crate::pipeline::global_cache::GlobalCache;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};

/// One raw line handed to the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakeLine {
    pub text: String,
    /// Intake source, numbered from 1
    pub source_no: usize,
}

impl IntakeLine {
    pub fn new(text: impl Into<String>, source_no: usize) -> Self {
        IntakeLine {
            text: text.into(),
            source_no,
        }
    }
}

/// Supplies intake lines; `None` ends the intake
#[async_trait]
pub trait LineSource: Send {
    async fn supply(&mut self, cache: &GlobalCache) -> anyhow::Result<Option<IntakeLine>>;
}

/// Receives formatted lines per target; `None` ends the data for that target
#[async_trait]
pub trait LineSink: Send {
    async fn consume(
        &mut self,
        line: Option<String>,
        target_no: usize,
        cache: &GlobalCache,
    ) -> anyhow::Result<()>;
}

/// Synchronous source backed by a closure
pub struct FnSource<F>(pub F);

#[async_trait]
impl<F> LineSource for FnSource<F>
where
    F: FnMut(&GlobalCache) -> anyhow::Result<Option<IntakeLine>> + Send,
{
    async fn supply(&mut self, cache: &GlobalCache) -> anyhow::Result<Option<IntakeLine>> {
        (self.0)(cache)
    }
}

/// Synchronous sink backed by a closure
pub struct FnSink<F>(pub F);

#[async_trait]
impl<F> LineSink for FnSink<F>
where
    F: FnMut(Option<String>, usize, &GlobalCache) -> anyhow::Result<()> + Send,
{
    async fn consume(
        &mut self,
        line: Option<String>,
        target_no: usize,
        cache: &GlobalCache,
    ) -> anyhow::Result<()> {
        (self.0)(line, target_no, cache)
    }
}

/// In-memory lines, all from source 1
pub struct IterSource<I> {
    lines: I,
}

impl<I> IterSource<I> {
    pub fn new<T>(lines: T) -> Self
    where
        T: IntoIterator<IntoIter = I>,
    {
        IterSource {
            lines: lines.into_iter(),
        }
    }
}

#[async_trait]
impl<I, S> LineSource for IterSource<I>
where
    I: Iterator<Item = S> + Send,
    S: Into<String>,
{
    async fn supply(&mut self, _cache: &GlobalCache) -> anyhow::Result<Option<IntakeLine>> {
        Ok(self.lines.next().map(|text| IntakeLine::new(text, 1)))
    }
}

pub type BoxedReader = Box<dyn AsyncBufRead + Unpin + Send>;

/// Reads several streams one after another; stream N is source N
pub struct ReaderSource {
    readers: Vec<Lines<BoxedReader>>,
    current: usize,
}

impl ReaderSource {
    pub fn new(readers: Vec<BoxedReader>) -> Self {
        ReaderSource {
            readers: readers.into_iter().map(|r| r.lines()).collect(),
            current: 0,
        }
    }
}

#[async_trait]
impl LineSource for ReaderSource {
    async fn supply(&mut self, _cache: &GlobalCache) -> anyhow::Result<Option<IntakeLine>> {
        while let Some(lines) = self.readers.get_mut(self.current) {
            if let Some(line) = lines.next_line().await? {
                return Ok(Some(IntakeLine::new(line, self.current + 1)));
            }
            self.current += 1;
        }
        Ok(None)
    }
}

pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Writes target N to writer N
pub struct WriterSink {
    writers: Vec<BoxedWriter>,
}

impl WriterSink {
    pub fn new(writers: Vec<BoxedWriter>) -> Self {
        WriterSink { writers }
    }
}

#[async_trait]
impl LineSink for WriterSink {
    async fn consume(
        &mut self,
        line: Option<String>,
        target_no: usize,
        _cache: &GlobalCache,
    ) -> anyhow::Result<()> {
        let writer = target_no
            .checked_sub(1)
            .and_then(|i| self.writers.get_mut(i))
            .ok_or_else(|| anyhow::anyhow!("no output for target #{}", target_no))?;
        let written = match line {
            Some(line) => {
                let mut bytes = line.into_bytes();
                bytes.push(b'\n');
                writer.write_all(&bytes).await
            }
            None => writer.flush().await,
        };
        written.map_err(ProcessingError::from)?;
        Ok(())
    }
}

/// What a [`CollectingSink`] received
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Collected {
    pub lines: BTreeMap<usize, Vec<String>>,
    /// End-of-data markers per target
    pub ends: BTreeMap<usize, usize>,
}

/// Keeps every line in memory, grouped by target
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    collected: Arc<Mutex<Collected>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collected(&self) -> Collected {
        self.collected.lock().clone()
    }

    pub fn lines(&self, target_no: usize) -> Vec<String> {
        self.collected
            .lock()
            .lines
            .get(&target_no)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl LineSink for CollectingSink {
    async fn consume(
        &mut self,
        line: Option<String>,
        target_no: usize,
        _cache: &GlobalCache,
    ) -> anyhow::Result<()> {
        let mut collected = self.collected.lock();
        match line {
            Some(line) => collected.lines.entry(target_no).or_default().push(line),
            None => *collected.ends.entry(target_no).or_default() += 1,
        }
        Ok(())
    }
}
