use std::collections::HashSet;

use common::{
    error::AppError,
    storage::types::{collection_info::CollectionInfo, retrievable_unit::RetrievableUnit},
    utils::data_dictionary::{DataDictionary, Record},
};
use state_machines::core::GuardError;
use tracing::{debug, info, instrument};

use super::{
    context::IndexRunContext,
    state::{Completed, IndexRunMachine, Indexed, Loaded, Ready},
    FieldReport, IndexRunMode,
};
use crate::{differ::diff_collection, documents::build_units, indexer::CollectionIndexer};

#[instrument(level = "trace", skip_all, fields(run = ctx.mode.label()))]
pub async fn load_dictionary(
    machine: IndexRunMachine<(), Ready>,
    ctx: &mut IndexRunContext<'_>,
) -> Result<IndexRunMachine<(), Loaded>, AppError> {
    let settings = &ctx.config.index;
    let path = match ctx.mode {
        IndexRunMode::Setup => settings.filepath_input.clone(),
        IndexRunMode::Update => settings.filepath_update.clone().ok_or_else(|| {
            AppError::Validation("index.filepath_update must be set for an update run".into())
        })?,
    };

    let dictionary = DataDictionary::load(&path, None)?.drop_missing_id(&settings.id_column);

    info!(
        run = ctx.mode.label(),
        path = %path.display(),
        records = dictionary.len(),
        "index input ready"
    );
    ctx.dictionary = Some(dictionary);

    machine
        .load()
        .map_err(|(_, guard)| map_guard_error("load", &guard))
}

#[instrument(level = "trace", skip_all, fields(run = ctx.mode.label()))]
pub async fn index_fields(
    machine: IndexRunMachine<(), Loaded>,
    ctx: &mut IndexRunContext<'_>,
) -> Result<IndexRunMachine<(), Indexed>, AppError> {
    let settings = &ctx.config.index;
    let (db, embedding) = (ctx.db, ctx.embedding);
    let indexer = CollectionIndexer::new(db, embedding, settings.max_batch_size);

    for field in &settings.columns {
        let dictionary = ctx.dictionary()?;
        let records: Vec<&Record> = dictionary.with_field(field).collect();

        let collection = db
            .get_or_create_collection(
                field,
                embedding.dimension(),
                settings.distance_metric,
                embedding.model_code(),
            )
            .await?;

        let units = build_units(
            records.iter().copied(),
            field,
            &settings.id_column,
            &settings.metadata_columns,
        );

        let report = match ctx.mode {
            IndexRunMode::Setup => {
                let added = indexer.add(first_per_id(units), &collection).await?;
                FieldReport::new(field, &collection, records.len(), added.added, 0)
            }
            IndexRunMode::Update => {
                let stored = db.collection_metadata(&collection).await?;
                let diff = diff_collection(
                    records.iter().copied(),
                    &stored,
                    &settings.id_column,
                    &settings.last_change_column,
                )?;

                let (to_add, to_update) = split_units(units, &diff.to_add, &diff.to_update);
                let added = indexer.add(to_add, &collection).await?;
                let updated = indexer.update(to_update, &collection).await?;
                FieldReport::new(field, &collection, records.len(), added.added, updated)
            }
        };

        info!(
            field = %report.field,
            collection = %report.collection,
            records = report.records,
            added = report.added,
            updated = report.updated,
            "field indexed"
        );
        ctx.fields.push(report);
    }

    machine
        .index()
        .map_err(|(_, guard)| map_guard_error("index", &guard))
}

#[instrument(level = "trace", skip_all, fields(run = ctx.mode.label()))]
pub async fn complete(
    machine: IndexRunMachine<(), Indexed>,
    ctx: &mut IndexRunContext<'_>,
) -> Result<IndexRunMachine<(), Completed>, AppError> {
    let db = ctx.db;
    for report in &mut ctx.fields {
        let collection = db.get_collection(&report.field).await?.ok_or_else(|| {
            AppError::NotFound(format!("collection for field '{}'", report.field))
        })?;
        report.total_units = db.count_units(&collection).await?;
        debug!(field = %report.field, total_units = report.total_units, "collection size");
    }

    machine
        .complete()
        .map_err(|(_, guard)| map_guard_error("complete", &guard))
}

/// Keeps the first unit of every id.
fn first_per_id(units: Vec<RetrievableUnit>) -> Vec<RetrievableUnit> {
    let mut seen = HashSet::new();
    units
        .into_iter()
        .filter(|unit| seen.insert(unit.id.clone()))
        .collect()
}

/// Splits built units into the diff's add and update sets, keeping record order.
fn split_units(
    units: Vec<RetrievableUnit>,
    to_add: &[String],
    to_update: &[String],
) -> (Vec<RetrievableUnit>, Vec<RetrievableUnit>) {
    let add: HashSet<&str> = to_add.iter().map(String::as_str).collect();
    let update: HashSet<&str> = to_update.iter().map(String::as_str).collect();

    let mut adds = Vec::with_capacity(add.len());
    let mut updates = Vec::with_capacity(update.len());
    for unit in first_per_id(units) {
        if add.contains(unit.id.as_str()) {
            adds.push(unit);
        } else if update.contains(unit.id.as_str()) {
            updates.push(unit);
        }
    }
    (adds, updates)
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid index run transition during {event}: {guard:?}"
    ))
}

impl FieldReport {
    fn new(
        field: &str,
        collection: &CollectionInfo,
        records: usize,
        added: usize,
        updated: usize,
    ) -> Self {
        Self {
            field: field.to_string(),
            collection: collection.table.clone(),
            records,
            added,
            updated,
            total_units: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn unit(id: &str) -> RetrievableUnit {
        RetrievableUnit {
            id: id.into(),
            text: format!("text {id}"),
            metadata: Map::new(),
        }
    }

    #[test]
    fn split_follows_diff_and_skips_duplicates() {
        let units = vec![unit("A"), unit("B"), unit("C"), unit("A")];
        let (adds, updates) = split_units(units, &["C".into(), "A".into()], &["B".into()]);

        let add_ids: Vec<_> = adds.iter().map(|u| u.id.as_str()).collect();
        let update_ids: Vec<_> = updates.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(add_ids, vec!["A", "C"]);
        assert_eq!(update_ids, vec!["B"]);
    }

    #[test]
    fn duplicate_ids_keep_the_first_unit() {
        let mut later = unit("A");
        later.text = "replacement".into();
        let kept = first_per_id(vec![unit("A"), unit("B"), later]);

        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].text, "text A");
    }
}
