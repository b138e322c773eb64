use std::{collections::HashMap, fs::File, io::Read, path::Path};

use csv::ReaderBuilder;
use tracing::{debug, info};

use crate::error::AppError;

/// One data dictionary row. Every value is text; empty cells are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    values: HashMap<String, String>,
}

impl Record {
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let values = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v): &(String, String)| !v.is_empty())
            .collect();
        Self { values }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).map(String::as_str)
    }

    pub fn has(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }
}

/// A loaded data dictionary: header order plus rows in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataDictionary {
    pub headers: Vec<String>,
    pub records: Vec<Record>,
}

impl DataDictionary {
    /// Reads a CSV file, keeping only `usecols` when given.
    pub fn load(path: &Path, usecols: Option<&[String]>) -> Result<Self, AppError> {
        let file = File::open(path).map_err(|err| {
            AppError::NotFound(format!("data dictionary {}: {err}", path.display()))
        })?;
        let dictionary = Self::from_reader(file, usecols)?;
        info!(
            path = %path.display(),
            rows = dictionary.records.len(),
            columns = dictionary.headers.len(),
            "Loaded data dictionary"
        );
        Ok(dictionary)
    }

    pub fn from_reader<R: Read>(reader: R, usecols: Option<&[String]>) -> Result<Self, AppError> {
        let mut csv_reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let file_headers: Vec<String> = csv_reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        if let Some(wanted) = usecols {
            let missing: Vec<&str> = wanted
                .iter()
                .filter(|col| !file_headers.contains(col))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(AppError::Validation(format!(
                    "columns not found in data dictionary: {}",
                    missing.join(", ")
                )));
            }
        }

        let keep: Vec<bool> = file_headers
            .iter()
            .map(|h| usecols.map_or(true, |wanted| wanted.contains(h)))
            .collect();

        let mut records = Vec::new();
        for row in csv_reader.records() {
            let row = row?;
            let record = Record::from_pairs(
                file_headers
                    .iter()
                    .zip(row.iter())
                    .zip(&keep)
                    .filter(|(_, keep)| **keep)
                    .map(|((header, value), _)| (header.clone(), value.to_string())),
            );
            records.push(record);
        }

        let headers = file_headers
            .into_iter()
            .zip(keep)
            .filter_map(|(h, keep)| keep.then_some(h))
            .collect();

        Ok(Self { headers, records })
    }

    /// Drops rows lacking a value in any of `columns`.
    #[must_use]
    pub fn drop_missing_any(mut self, columns: &[String]) -> Self {
        let before = self.records.len();
        self.records
            .retain(|record| columns.iter().all(|col| record.has(col)));
        let dropped = before - self.records.len();
        if dropped > 0 {
            debug!(dropped, columns = ?columns, "Dropped incomplete rows");
        }
        self
    }

    #[must_use]
    pub fn drop_missing_id(self, id_column: &str) -> Self {
        self.drop_missing_any(&[id_column.to_string()])
    }

    /// Rows holding a value for `field`.
    pub fn with_field<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a Record> + 'a {
        self.records.iter().filter(move |record| record.has(field))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
