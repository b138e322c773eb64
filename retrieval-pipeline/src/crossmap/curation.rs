use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
    fs,
    path::Path,
};

use common::{error::AppError, utils::data_dictionary::Record};
use csv::Writer;
use serde_json::Value;

use crate::query_engine::CandidateMatch;

pub const QUERY_ENGINE_COLUMN: &str = "query_engine";
pub const RESULT_SUFFIX: &str = "_result";

/// A candidate tagged with the record and text that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub query_id: String,
    pub query_text: String,
    pub candidate: CandidateMatch,
}

/// One (query record, field, candidate) triple. Either side may be absent.
#[derive(Debug, Clone, PartialEq)]
pub struct CurationRow {
    pub record: Option<Record>,
    pub field: String,
    pub result: Option<QueryResult>,
}

impl CurationRow {
    fn identity<'a>(&'a self, id_column: &str) -> Option<&'a str> {
        self.record.as_ref().and_then(|r| r.get(id_column))
    }

    fn score(&self) -> Option<f32> {
        self.result.as_ref().map(|r| r.candidate.rerank_score)
    }
}

/// Outer-joins a field's results onto the query records by identity.
///
/// Records without results appear once with no candidate; results whose identity matches
/// no record are kept without a record.
pub fn merge_results(
    records: &[Record],
    field: &str,
    results: Vec<QueryResult>,
    id_column: &str,
) -> Vec<CurationRow> {
    let mut by_query: HashMap<String, Vec<QueryResult>> = HashMap::new();
    let mut query_order = Vec::new();
    for result in results {
        if !by_query.contains_key(&result.query_id) {
            query_order.push(result.query_id.clone());
        }
        by_query
            .entry(result.query_id.clone())
            .or_default()
            .push(result);
    }

    let mut rows = Vec::with_capacity(records.len());
    let mut matched = HashSet::new();
    for record in records {
        let matches = record.get(id_column).and_then(|id| by_query.get(id));
        match matches {
            Some(results) if !results.is_empty() => {
                matched.insert(record.get(id_column).unwrap_or_default().to_string());
                rows.extend(results.iter().map(|result| CurationRow {
                    record: Some(record.clone()),
                    field: field.to_string(),
                    result: Some(result.clone()),
                }));
            }
            _ => rows.push(CurationRow {
                record: Some(record.clone()),
                field: field.to_string(),
                result: None,
            }),
        }
    }

    for query_id in query_order {
        if matched.contains(&query_id) {
            continue;
        }
        if let Some(orphans) = by_query.remove(&query_id) {
            rows.extend(orphans.into_iter().map(|result| CurationRow {
                record: None,
                field: field.to_string(),
                result: Some(result),
            }));
        }
    }

    rows
}

/// Ascending identity, ascending field, descending rerank score; absent values sort last.
pub fn sort_rows(rows: &mut [CurationRow], id_column: &str) {
    rows.sort_by(|a, b| {
        none_last(a.identity(id_column), b.identity(id_column), |x, y| x.cmp(y))
            .then_with(|| a.field.cmp(&b.field))
            .then_with(|| none_last(a.score(), b.score(), |x, y| y.total_cmp(x)))
    });
}

fn none_last<T>(a: Option<T>, b: Option<T>, cmp: impl FnOnce(&T, &T) -> Ordering) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => cmp(&a, &b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// The table handed to curators.
#[derive(Debug, Clone, PartialEq)]
pub struct CurationTable {
    pub columns: Vec<String>,
    pub rows: Vec<CurationRow>,
    query_columns: Vec<String>,
    candidate_keys: Vec<String>,
    id_column: String,
}

impl CurationTable {
    /// Lays out the columns: query record columns, the field, then the suffixed candidate columns.
    pub fn new(query_columns: Vec<String>, id_column: &str, rows: Vec<CurationRow>) -> Self {
        let mut candidate_keys: Vec<String> = Vec::new();
        for row in &rows {
            if let Some(result) = &row.result {
                for key in result.candidate.metadata.keys() {
                    if !candidate_keys.contains(key) {
                        candidate_keys.push(key.clone());
                    }
                }
            }
        }

        let mut columns = query_columns.clone();
        columns.push(QUERY_ENGINE_COLUMN.to_string());
        columns.push(format!("{id_column}_query{RESULT_SUFFIX}"));
        columns.push(format!("query_text{RESULT_SUFFIX}"));
        columns.push(format!("node_id{RESULT_SUFFIX}"));
        columns.push(format!("rank{RESULT_SUFFIX}"));
        columns.extend(candidate_keys.iter().map(|k| format!("{k}{RESULT_SUFFIX}")));
        columns.push(format!("similarity_score{RESULT_SUFFIX}"));
        columns.push(format!("score{RESULT_SUFFIX}"));

        Self {
            columns,
            rows,
            query_columns,
            candidate_keys,
            id_column: id_column.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn sort(&mut self) {
        sort_rows(&mut self.rows, &self.id_column);
    }

    /// Cell values of a row, aligned with `columns`. Empty strings stand for missing values.
    pub fn row_values(&self, row: &CurationRow) -> Vec<String> {
        let mut values = Vec::with_capacity(self.columns.len());
        values.extend(self.query_columns.iter().map(|column| {
            row.record
                .as_ref()
                .and_then(|r| r.get(column))
                .unwrap_or_default()
                .to_string()
        }));
        values.push(row.field.clone());

        match &row.result {
            Some(result) => {
                let candidate = &result.candidate;
                values.push(result.query_id.clone());
                values.push(result.query_text.clone());
                values.push(candidate.id.clone());
                values.push(candidate.rank.to_string());
                values.extend(
                    self.candidate_keys
                        .iter()
                        .map(|key| metadata_cell(candidate.metadata.get(key))),
                );
                values.push(candidate.similarity.to_string());
                values.push(candidate.rerank_score.to_string());
            }
            None => values.resize(self.columns.len(), String::new()),
        }
        values
    }

    /// Writes the table as CSV, creating the parent directory when needed.
    pub fn write_csv(&self, path: &Path) -> Result<(), AppError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = Writer::from_path(path)?;
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(self.row_values(row))?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn metadata_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::retrievable_unit::Metadata;
    use serde_json::json;

    const ID: &str = "variable name";

    fn record(id: &str, title: &str) -> Record {
        Record::from_pairs([(ID, id), ("title", title)])
    }

    fn result(query_id: &str, candidate_id: &str, score: f32, rank: usize) -> QueryResult {
        let mut metadata = Metadata::new();
        metadata.insert(ID.into(), json!(candidate_id));
        metadata.insert("version".into(), Value::Null);
        QueryResult {
            query_id: query_id.into(),
            query_text: format!("text of {query_id}"),
            candidate: CandidateMatch {
                id: candidate_id.into(),
                text: format!("candidate {candidate_id}"),
                metadata,
                similarity: 0.5,
                rerank_score: score,
                rank,
            },
        }
    }

    #[test]
    fn merge_keeps_records_without_hits_and_orphans() {
        let records = vec![record("V1", "Age"), record("V2", "Weight")];
        let results = vec![
            result("V1", "R1", 0.9, 1),
            result("V1", "R2", 0.4, 2),
            result("V9", "R3", 0.7, 1),
        ];

        let rows = merge_results(&records, "title", results, ID);

        assert_eq!(rows.len(), 4);
        let v2 = rows
            .iter()
            .find(|r| r.identity(ID) == Some("V2"))
            .expect("V2 row");
        assert!(v2.result.is_none());

        let orphan = rows.iter().find(|r| r.record.is_none()).expect("orphan");
        assert_eq!(orphan.result.as_ref().map(|r| r.query_id.as_str()), Some("V9"));
        assert!(rows.iter().all(|r| r.field == "title"));
    }

    #[test]
    fn sort_orders_identity_field_then_score() {
        let records = vec![record("V2", "Weight"), record("V1", "Age")];
        let mut rows = merge_results(
            &records,
            "title",
            vec![
                result("V1", "R1", 0.2, 2),
                result("V1", "R2", 0.8, 1),
                result("V8", "R9", 0.5, 1),
            ],
            ID,
        );
        rows.extend(merge_results(
            &records,
            "definition",
            vec![result("V1", "R5", 0.3, 1)],
            ID,
        ));

        sort_rows(&mut rows, ID);

        let keys: Vec<(Option<&str>, &str, Option<f32>)> = rows
            .iter()
            .map(|r| (r.identity(ID), r.field.as_str(), r.score()))
            .collect();
        assert_eq!(
            keys,
            vec![
                (Some("V1"), "definition", Some(0.3)),
                (Some("V1"), "title", Some(0.8)),
                (Some("V1"), "title", Some(0.2)),
                (Some("V2"), "definition", None),
                (Some("V2"), "title", None),
                (None, "title", Some(0.5)),
            ]
        );
    }

    #[test]
    fn columns_and_values_line_up() {
        let records = vec![record("V1", "Age"), record("V2", "Weight")];
        let rows = merge_results(&records, "title", vec![result("V1", "R1", 0.9, 1)], ID);
        let table = CurationTable::new(vec![ID.into(), "title".into()], ID, rows);

        assert_eq!(
            table.columns,
            vec![
                "variable name",
                "title",
                "query_engine",
                "variable name_query_result",
                "query_text_result",
                "node_id_result",
                "rank_result",
                "variable name_result",
                "version_result",
                "similarity_score_result",
                "score_result",
            ]
        );

        let first = table.row_values(&table.rows[0]);
        assert_eq!(first.len(), table.columns.len());
        assert_eq!(first[..7], ["V1", "Age", "title", "V1", "text of V1", "R1", "1"]);
        assert_eq!(first[7], "R1");
        assert_eq!(first[8], "");
        assert_eq!(first[10], "0.9");

        let empty = table.row_values(&table.rows[1]);
        assert_eq!(empty.len(), table.columns.len());
        assert_eq!(empty[..3], ["V2", "Weight", "title"]);
        assert!(empty[3..].iter().all(String::is_empty));
    }

    #[test]
    fn writes_csv_with_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("curation").join("semantic-search_title.csv");
        let records = vec![record("V1", "Age")];
        let rows = merge_results(&records, "title", vec![result("V1", "R1", 0.9, 1)], ID);
        let table = CurationTable::new(vec![ID.into(), "title".into()], ID, rows);

        table.write_csv(&path).expect("write csv");

        let mut reader = csv::Reader::from_path(&path).expect("read csv");
        let headers = reader.headers().expect("headers").clone();
        assert_eq!(headers.len(), table.columns.len());
        assert_eq!(reader.records().count(), 1);
    }
}
