use crate::pipeline::cluster::Cluster;
use crate::pipeline::global_cache::GlobalCache;
use crate::pipeline::record::Record;
use std::fmt;
use std::sync::Arc;

pub type RecordFn = Arc<dyn Fn(Record, &GlobalCache) -> anyhow::Result<Option<Record>> + Send + Sync>;
pub type ClusterFn =
    Arc<dyn Fn(Cluster, &GlobalCache) -> anyhow::Result<Option<Cluster>> + Send + Sync>;
pub type RecordPredicate = Arc<dyn Fn(&Record, &GlobalCache) -> anyhow::Result<bool> + Send + Sync>;
pub type ClusterPredicate =
    Arc<dyn Fn(&Cluster, &GlobalCache) -> anyhow::Result<bool> + Send + Sync>;
pub type UniversalFn =
    Arc<dyn Fn(Cluster, &GlobalCache) -> anyhow::Result<Vec<Cluster>> + Send + Sync>;

/// User transformation applied to each cluster
#[derive(Clone)]
pub enum Transformer {
    /// Map each record; `None` drops it
    Record(RecordFn),
    /// Map the whole cluster; `None` drops it
    Cluster(ClusterFn),
    /// Keep the records for which the predicate holds
    RecordFilter(RecordPredicate),
    /// Keep the cluster if the predicate holds
    ClusterFilter(ClusterPredicate),
    /// One cluster in, any number out
    Universal(UniversalFn),
}

impl fmt::Debug for Transformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Transformer::Record(_) => "Record",
            Transformer::Cluster(_) => "Cluster",
            Transformer::RecordFilter(_) => "RecordFilter",
            Transformer::ClusterFilter(_) => "ClusterFilter",
            Transformer::Universal(_) => "Universal",
        };
        write!(f, "Transformer::{}", kind)
    }
}

impl Default for Transformer {
    fn default() -> Self {
        Transformer::identity()
    }
}

impl Transformer {
    pub fn identity() -> Self {
        Transformer::Cluster(Arc::new(|cluster, _| Ok(Some(cluster))))
    }

    pub fn record<F>(f: F) -> Self
    where
        F: Fn(Record, &GlobalCache) -> anyhow::Result<Option<Record>> + Send + Sync + 'static,
    {
        Transformer::Record(Arc::new(f))
    }

    pub fn cluster<F>(f: F) -> Self
    where
        F: Fn(Cluster, &GlobalCache) -> anyhow::Result<Option<Cluster>> + Send + Sync + 'static,
    {
        Transformer::Cluster(Arc::new(f))
    }

    pub fn record_filter<F>(f: F) -> Self
    where
        F: Fn(&Record, &GlobalCache) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Transformer::RecordFilter(Arc::new(f))
    }

    pub fn cluster_filter<F>(f: F) -> Self
    where
        F: Fn(&Cluster, &GlobalCache) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Transformer::ClusterFilter(Arc::new(f))
    }

    pub fn universal<F>(f: F) -> Self
    where
        F: Fn(Cluster, &GlobalCache) -> anyhow::Result<Vec<Cluster>> + Send + Sync + 'static,
    {
        Transformer::Universal(Arc::new(f))
    }

    /// Apply to one cluster. Empty clusters are not passed on.
    pub fn apply(&self, cluster: Cluster, cache: &GlobalCache) -> anyhow::Result<Vec<Cluster>> {
        let clstr_no = cluster.clstr_no();
        let out = match self {
            Transformer::Record(f) => {
                let mut records = Vec::with_capacity(cluster.count());
                for record in cluster {
                    if let Some(record) = f(record, cache)? {
                        records.push(record);
                    }
                }
                vec![Cluster::new(clstr_no, records)]
            }
            Transformer::Cluster(f) => f(cluster, cache)?.into_iter().collect(),
            Transformer::RecordFilter(f) => {
                let mut records = Vec::with_capacity(cluster.count());
                for record in cluster {
                    if f(&record, cache)? {
                        records.push(record);
                    }
                }
                vec![Cluster::new(clstr_no, records)]
            }
            Transformer::ClusterFilter(f) => {
                if f(&cluster, cache)? {
                    vec![cluster]
                } else {
                    Vec::new()
                }
            }
            Transformer::Universal(f) => f(cluster, cache)?,
        };
        Ok(out.into_iter().filter(|c| !c.is_empty()).collect())
    }
}

pub type SourceMapFn = Arc<dyn Fn(usize) -> usize + Send + Sync>;
pub type ClusterRouteFn = Arc<dyn Fn(&Cluster, &GlobalCache) -> anyhow::Result<usize> + Send + Sync>;
pub type RecordRouteFn = Arc<dyn Fn(&Record, &GlobalCache) -> anyhow::Result<usize> + Send + Sync>;

/// Chooses the output target (numbered from 1) for transformed data
#[derive(Clone, Default)]
pub enum Router {
    /// Everything goes to target 1
    #[default]
    SingleTarget,
    /// Target derived from each record's source number
    SourceToTarget(SourceMapFn),
    /// One target per cluster
    PerCluster(ClusterRouteFn),
    /// One target per record
    PerRecord(RecordRouteFn),
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Router::SingleTarget => "SingleTarget",
            Router::SourceToTarget(_) => "SourceToTarget",
            Router::PerCluster(_) => "PerCluster",
            Router::PerRecord(_) => "PerRecord",
        };
        write!(f, "Router::{}", kind)
    }
}

impl Router {
    /// Source N goes to target N
    pub fn source_to_target() -> Self {
        Router::SourceToTarget(Arc::new(|source_no| source_no))
    }

    pub fn per_cluster<F>(f: F) -> Self
    where
        F: Fn(&Cluster, &GlobalCache) -> anyhow::Result<usize> + Send + Sync + 'static,
    {
        Router::PerCluster(Arc::new(f))
    }

    pub fn per_record<F>(f: F) -> Self
    where
        F: Fn(&Record, &GlobalCache) -> anyhow::Result<usize> + Send + Sync + 'static,
    {
        Router::PerRecord(Arc::new(f))
    }

    /// Pair each record of the cluster with its target. Either the whole
    /// cluster is routed or an error is returned.
    pub fn route(&self, cluster: Cluster, cache: &GlobalCache) -> anyhow::Result<Vec<(usize, Record)>> {
        let routed: Vec<(usize, Record)> = match self {
            Router::SingleTarget => cluster.into_iter().map(|r| (1, r)).collect(),
            Router::SourceToTarget(f) => cluster
                .into_iter()
                .map(|r| (f(r.source_no()), r))
                .collect(),
            Router::PerCluster(f) => {
                let target = f(&cluster, cache)?;
                cluster.into_iter().map(|r| (target, r)).collect()
            }
            Router::PerRecord(f) => {
                let mut routed = Vec::with_capacity(cluster.count());
                for record in cluster {
                    let target = f(&record, cache)?;
                    routed.push((target, record));
                }
                routed
            }
        };
        if let Some((_, record)) = routed.iter().find(|(target, _)| *target == 0) {
            anyhow::bail!("record #{} routed to target 0; targets start at 1", record.rec_no());
        }
        Ok(routed)
    }
}
