use common::{
    storage::types::retrievable_unit::{Metadata, RetrievableUnit},
    utils::data_dictionary::Record,
};
use serde_json::Value;

/// Builds one unit per record from the value of `field`.
///
/// Records are expected to carry both the id and the field; callers filter with
/// `DataDictionary::with_field` first. Metadata holds every configured column,
/// `null` where the record has no value.
pub fn build_units<'a, I>(
    records: I,
    field: &str,
    id_column: &str,
    metadata_columns: &[String],
) -> Vec<RetrievableUnit>
where
    I: IntoIterator<Item = &'a Record>,
{
    records
        .into_iter()
        .map(|record| RetrievableUnit {
            id: record.get(id_column).unwrap_or_default().to_string(),
            text: record.get(field).unwrap_or_default().to_string(),
            metadata: record_metadata(record, metadata_columns),
        })
        .collect()
}

fn record_metadata(record: &Record, metadata_columns: &[String]) -> Metadata {
    metadata_columns
        .iter()
        .map(|column| {
            let value = record
                .get(column)
                .map_or(Value::Null, |v| Value::String(v.to_string()));
            (column.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_unit_per_record_with_metadata() {
        let records = vec![
            Record::from_pairs([
                ("variable name", "V1"),
                ("title", "Age"),
                ("definition", "Age at visit"),
            ]),
            Record::from_pairs([("variable name", "V2"), ("title", "Weight")]),
        ];
        let metadata_columns = vec![
            "variable name".to_string(),
            "title".to_string(),
            "definition".to_string(),
        ];

        let units = build_units(&records, "title", "variable name", &metadata_columns);

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].id, "V1");
        assert_eq!(units[0].text, "Age");
        assert_eq!(units[0].metadata_str("definition"), Some("Age at visit"));
        assert_eq!(units[1].metadata.get("definition"), Some(&Value::Null));
        assert_eq!(units[1].metadata.len(), 3);
    }

    #[test]
    fn empty_input_builds_nothing() {
        let units = build_units(&Vec::<Record>::new(), "title", "variable name", &[]);
        assert!(units.is_empty());
    }
}
