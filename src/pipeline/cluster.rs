use crate::pipeline::record::Record;

/// Ordered group of records sharing one cluster number
#[derive(Debug, Clone, Default)]
pub struct Cluster {
    clstr_no: usize,
    records: Vec<Record>,
}

impl Cluster {
    /// Build a cluster, stamping its number onto every record
    pub fn new(clstr_no: usize, mut records: Vec<Record>) -> Self {
        for record in &mut records {
            record.set_clstr_no(clstr_no);
        }
        Cluster { clstr_no, records }
    }

    pub fn clstr_no(&self) -> usize {
        self.clstr_no
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Record> {
        self.records.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Record> {
        self.records.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Record> {
        self.records.iter_mut()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Append a record; it takes this cluster's number
    pub fn push(&mut self, mut record: Record) {
        record.set_clstr_no(self.clstr_no);
        self.records.push(record);
    }

    pub fn remove(&mut self, index: usize) -> Option<Record> {
        if index < self.records.len() {
            Some(self.records.remove(index))
        } else {
            None
        }
    }

    /// Keep only the records matching the predicate
    pub fn retain(&mut self, f: impl FnMut(&Record) -> bool) {
        self.records.retain(f);
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    /// Same number and records, with independent TraceBins
    pub fn deep_clone(&self) -> Cluster {
        Cluster {
            clstr_no: self.clstr_no,
            records: self.records.iter().map(Record::deep_clone).collect(),
        }
    }
}

impl IntoIterator for Cluster {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a Cluster {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
