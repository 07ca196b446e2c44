use crate::pipeline::cluster::Cluster;
use crate::pipeline::record::Record;
use regex::Regex;
use std::sync::Arc;

/// Decides cluster boundaries: `(record, previous_record, count_in_current_cluster)`
pub type ClusterMarker =
    Arc<dyn Fn(&Record, Option<&Record>, usize) -> anyhow::Result<bool> + Send + Sync>;

/// Marker matching records whose field text matches a pattern
pub fn field_matches(field: impl Into<String>, pattern: Regex) -> ClusterMarker {
    let field = field.into();
    Arc::new(move |record, _, _| Ok(pattern.is_match(record.get_str(&field))))
}

/// Marker closing a cluster after a fixed number of records
pub fn fixed_size(size: usize) -> ClusterMarker {
    Arc::new(move |_, _, count| Ok(count + 1 >= size))
}

/// Parse `FIELD=REGEX` into a field marker
pub fn parse_cluster_on(spec: &str) -> Result<ClusterMarker, String> {
    let (field, pattern) = spec
        .split_once('=')
        .ok_or_else(|| format!("Expected FIELD=REGEX, got: {}", spec))?;
    if field.is_empty() {
        return Err(format!("Missing field name in: {}", spec));
    }
    let regex = Regex::new(pattern).map_err(|e| format!("Invalid cluster pattern: {}", e))?;
    Ok(field_matches(field, regex))
}

/// Groups a record stream into numbered clusters.
///
/// Records go in one at a time through [`Clusterer::add_record`]; a finished
/// cluster comes out whenever a boundary is crossed, and [`Clusterer::flush`]
/// releases the last one.
pub struct Clusterer {
    marker: Option<ClusterMarker>,
    marker_starts_cluster: bool,
    current: Vec<Record>,
    previous: Option<Record>,
    clusters_emitted: usize,
}

impl Clusterer {
    pub fn new(marker: Option<ClusterMarker>, marker_starts_cluster: bool) -> Self {
        Self {
            marker,
            marker_starts_cluster,
            current: Vec::new(),
            previous: None,
            clusters_emitted: 0,
        }
    }

    /// Feed one record; returns the cluster it completed, if any.
    /// An error from the marker leaves the record unconsumed.
    pub fn add_record(&mut self, record: Record) -> anyhow::Result<Option<Cluster>> {
        let count = self.current.len();
        let is_marked = match &self.marker {
            Some(marker) => marker(&record, self.previous.as_ref(), count)?,
            None => self.default_boundary(&record),
        };
        self.previous = Some(record.clone());

        if self.marker.is_none() {
            // default: boundary means "starts a new cluster"
            return Ok(self.start_with(record, is_marked));
        }

        if self.marker_starts_cluster {
            Ok(self.start_with(record, is_marked))
        } else {
            self.current.push(record);
            if is_marked {
                Ok(Some(self.emit_current_cluster()))
            } else {
                Ok(None)
            }
        }
    }

    /// Release the cluster still being collected
    pub fn flush(&mut self) -> Option<Cluster> {
        if !self.current.is_empty() {
            Some(self.emit_current_cluster())
        } else {
            None
        }
    }

    pub fn clusters_emitted(&self) -> usize {
        self.clusters_emitted
    }

    fn start_with(&mut self, record: Record, is_marked: bool) -> Option<Cluster> {
        let done = if is_marked && !self.current.is_empty() {
            Some(self.emit_current_cluster())
        } else {
            None
        };
        self.current.push(record);
        done
    }

    /// Without a marker every record stands alone, unless the parser
    /// pre-assigned cluster numbers: then a change of number is a boundary.
    fn default_boundary(&self, record: &Record) -> bool {
        match &self.previous {
            Some(previous) if record.clstr_no() != 0 => record.clstr_no() != previous.clstr_no(),
            _ => true,
        }
    }

    fn emit_current_cluster(&mut self) -> Cluster {
        self.clusters_emitted += 1;
        Cluster::new(self.clusters_emitted, std::mem::take(&mut self.current))
    }
}

/// Cluster a whole record sequence
pub fn cluster_records(
    records: impl IntoIterator<Item = Record>,
    marker: Option<ClusterMarker>,
    marker_starts_cluster: bool,
) -> anyhow::Result<Vec<Cluster>> {
    let mut clusterer = Clusterer::new(marker, marker_starts_cluster);
    let mut clusters = Vec::new();

    for record in records {
        if let Some(cluster) = clusterer.add_record(record)? {
            clusters.push(cluster);
        }
    }

    if let Some(final_cluster) = clusterer.flush() {
        clusters.push(final_cluster);
    }

    Ok(clusters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::ActionOnDuplicateKey;
    use crate::pipeline::record::RecordBuilder;
    use crate::pipeline::registry::FieldRegistry;

    fn segments(names: &[&str]) -> Vec<Record> {
        let registry = FieldRegistry::new(true);
        names
            .iter()
            .map(|name| {
                let mut builder = RecordBuilder::new(&registry, ActionOnDuplicateKey::IgnoreItem);
                builder.add("Segment", name).unwrap();
                builder.build().unwrap()
            })
            .collect()
    }

    fn shape(clusters: &[Cluster]) -> Vec<Vec<String>> {
        clusters
            .iter()
            .map(|c| c.iter().map(|r| r.get_str("Segment").to_string()).collect())
            .collect()
    }

    #[test]
    fn test_default_is_one_record_per_cluster() {
        let clusters = cluster_records(segments(&["A", "B", "C"]), None, true).unwrap();
        assert_eq!(clusters.len(), 3);
        let numbers: Vec<usize> = clusters.iter().map(Cluster::clstr_no).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn test_marker_starts_cluster() {
        let marker = parse_cluster_on("Segment=^ISA$").unwrap();
        let clusters = cluster_records(
            segments(&["ISA", "GS", "ST", "ISA", "GS"]),
            Some(marker),
            true,
        )
        .unwrap();
        assert_eq!(
            shape(&clusters),
            vec![vec!["ISA", "GS", "ST"], vec!["ISA", "GS"]]
        );
    }

    #[test]
    fn test_marker_ends_cluster() {
        let marker = parse_cluster_on("Segment=^ISA$").unwrap();
        let clusters = cluster_records(
            segments(&["GS", "ISA", "ST", "ISA", "GS"]),
            Some(marker),
            false,
        )
        .unwrap();
        assert_eq!(
            shape(&clusters),
            vec![vec!["GS", "ISA"], vec!["ST", "ISA"], vec!["GS"]]
        );
    }

    #[test]
    fn test_cluster_numbers_written_to_records() {
        let clusters = cluster_records(segments(&["A", "B", "C", "D"]), Some(fixed_size(2)), false)
            .unwrap();
        assert_eq!(clusters.len(), 2);
        for cluster in &clusters {
            assert!(cluster.iter().all(|r| r.clstr_no() == cluster.clstr_no()));
        }
    }

    #[test]
    fn test_first_record_has_no_previous() {
        let marker: ClusterMarker = Arc::new(|_, previous, _| Ok(previous.is_none()));
        let clusters = cluster_records(segments(&["A", "B"]), Some(marker), true).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].count(), 2);
    }

    #[test]
    fn test_reclustering_is_idempotent() {
        let marker = parse_cluster_on("Segment=^H").unwrap();
        let input = segments(&["H1", "D", "D", "H2", "D"]);
        let first = cluster_records(input.clone(), Some(marker.clone()), true).unwrap();
        let second = cluster_records(input, Some(marker), true).unwrap();
        assert_eq!(shape(&first), shape(&second));
        assert_eq!(
            first.iter().map(Cluster::clstr_no).collect::<Vec<_>>(),
            second.iter().map(Cluster::clstr_no).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_preassigned_numbers_drive_default_boundaries() {
        let records: Vec<Record> = segments(&["A", "B", "C"])
            .into_iter()
            .zip([7, 7, 9])
            .map(|(r, n)| r.with_clstr_no(n))
            .collect();
        let clusters = cluster_records(records, None, true).unwrap();
        assert_eq!(shape(&clusters), vec![vec!["A", "B"], vec!["C"]]);
        assert_eq!(clusters[0].clstr_no(), 1);
    }

    #[test]
    fn test_marker_error_propagates() {
        let marker: ClusterMarker = Arc::new(|_, _, _| anyhow::bail!("bad marker"));
        let mut clusterer = Clusterer::new(Some(marker), true);
        let record = segments(&["A"]).remove(0);
        assert!(clusterer.add_record(record).is_err());
    }

    #[test]
    fn test_invalid_cluster_on() {
        assert!(parse_cluster_on("no-equals").is_err());
        assert!(parse_cluster_on("=x").is_err());
        assert!(parse_cluster_on("F=(").is_err());
    }
}
