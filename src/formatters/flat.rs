use crate::formatters::LineFormatter;
use crate::input_format::{FieldSpec, DEFAULT_FLAT_WIDTH};
use crate::pipeline::record::Record;

/// Fixed-width columns, padded with spaces and cut to width
pub struct FlatFormatter {
    widths: Vec<FieldSpec>,
}

impl FlatFormatter {
    pub fn new(widths: Vec<FieldSpec>) -> Self {
        Self { widths }
    }

    fn width_of(&self, field: &str) -> usize {
        self.widths
            .iter()
            .find(|spec| spec.name == field)
            .map(|spec| spec.width)
            .unwrap_or(DEFAULT_FLAT_WIDTH)
    }
}

fn fit(text: &str, width: usize) -> String {
    let mut cell: String = text.chars().take(width).collect();
    let len = cell.chars().count();
    cell.extend(std::iter::repeat(' ').take(width - len));
    cell
}

impl LineFormatter for FlatFormatter {
    fn format(&self, record: &Record, fields: &[String]) -> anyhow::Result<String> {
        Ok(fields
            .iter()
            .map(|field| fit(record.get_str(field), self.width_of(field)))
            .collect())
    }

    fn header(&self, fields: &[String]) -> Option<String> {
        Some(
            fields
                .iter()
                .map(|field| fit(field, self.width_of(field)))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::ActionOnDuplicateKey;
    use crate::pipeline::record::RecordBuilder;
    use crate::pipeline::registry::FieldRegistry;

    #[test]
    fn test_pad_and_truncate() {
        let registry = FieldRegistry::new(true);
        let mut builder = RecordBuilder::new(&registry, ActionOnDuplicateKey::IgnoreItem);
        builder.add("ID", "7").unwrap();
        builder.add("NAME", "Bartholomew").unwrap();
        let record = builder.build().unwrap();

        let formatter = FlatFormatter::new(FieldSpec::parse_list(&["ID|3", "NAME|5"]).unwrap());
        let fields = vec!["ID".to_string(), "NAME".to_string()];
        assert_eq!(formatter.format(&record, &fields).unwrap(), "7  Barth");
    }
}
