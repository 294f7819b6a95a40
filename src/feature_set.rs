//! Combining per-window feature tables into one wide table.

use std::collections::{BTreeSet, HashMap, HashSet};

use thiserror::Error;
use tracing::debug;

use crate::features::{
    FeatureColumn, FeatureRow, FeatureSchema, FeatureTable, GroupKey, Grouping,
    FEATURE_SCHEMA_VERSION,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeatureSetError {
    #[error("no feature tables to merge")]
    NothingToMerge,
    #[error("cannot merge {expected} features with {actual} features")]
    MixedGrouping {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("duplicate feature column {0}")]
    DuplicateColumn(String),
    #[error("expected a {expected} table, got {actual}")]
    WrongGrouping {
        expected: &'static str,
        actual: &'static str,
    },
}

/// Outer-joins tables of one grouping mode on their key.
pub fn merge_feature_tables(tables: &[FeatureTable]) -> Result<FeatureTable, FeatureSetError> {
    let first = tables.first().ok_or(FeatureSetError::NothingToMerge)?;
    let grouping = first.grouping();

    for table in tables {
        if table.grouping() != grouping {
            return Err(FeatureSetError::MixedGrouping {
                expected: grouping.as_str(),
                actual: table.grouping().as_str(),
            });
        }
    }

    let columns = concat_columns(tables.iter().map(|t| &t.schema))?;
    let keys: BTreeSet<&GroupKey> = tables
        .iter()
        .flat_map(|t| t.rows.iter().map(|row| &row.key))
        .collect();

    let rows = keys
        .into_iter()
        .map(|key| {
            let mut values = Vec::with_capacity(columns.len());
            for table in tables {
                match table.row(key) {
                    Some(row) => values.extend_from_slice(&row.values),
                    None => values.resize(values.len() + table.schema.columns.len(), None),
                }
            }
            FeatureRow {
                key: key.clone(),
                values,
            }
        })
        .collect::<Vec<_>>();

    debug!(
        component = "feature_set",
        event = "feature_set.merge",
        grouping = grouping.as_str(),
        tables = tables.len(),
        rows = rows.len(),
        columns = columns.len()
    );

    Ok(FeatureTable {
        schema: FeatureSchema::from_columns(FEATURE_SCHEMA_VERSION, grouping, columns),
        rows,
    })
}

/// One row per household+category key, with that household's household-level
/// columns appended. Households missing from `household` get `None` there.
pub fn assemble_feature_set(
    household: &FeatureTable,
    household_category: &FeatureTable,
) -> Result<FeatureTable, FeatureSetError> {
    expect_grouping(household, Grouping::Household)?;
    expect_grouping(household_category, Grouping::HouseholdCategory)?;

    let columns = concat_columns([&household_category.schema, &household.schema])?;
    let household_width = household.schema.columns.len();
    let by_household: HashMap<i64, &FeatureRow> = household
        .rows
        .iter()
        .map(|row| (row.key.household_key, row))
        .collect();

    let rows: Vec<FeatureRow> = household_category
        .rows
        .iter()
        .map(|row| {
            let mut values = Vec::with_capacity(columns.len());
            values.extend_from_slice(&row.values);
            match by_household.get(&row.key.household_key) {
                Some(household_row) => values.extend_from_slice(&household_row.values),
                None => values.resize(values.len() + household_width, None),
            }
            FeatureRow {
                key: row.key.clone(),
                values,
            }
        })
        .collect();

    Ok(FeatureTable {
        schema: FeatureSchema::from_columns(
            FEATURE_SCHEMA_VERSION,
            Grouping::HouseholdCategory,
            columns,
        ),
        rows,
    })
}

fn expect_grouping(table: &FeatureTable, expected: Grouping) -> Result<(), FeatureSetError> {
    if table.grouping() == expected {
        Ok(())
    } else {
        Err(FeatureSetError::WrongGrouping {
            expected: expected.as_str(),
            actual: table.grouping().as_str(),
        })
    }
}

fn concat_columns<'a>(
    schemas: impl IntoIterator<Item = &'a FeatureSchema>,
) -> Result<Vec<FeatureColumn>, FeatureSetError> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for schema in schemas {
        for column in &schema.columns {
            if !seen.insert(column.name.clone()) {
                return Err(FeatureSetError::DuplicateColumn(column.name.clone()));
            }
            out.push(column.clone());
        }
    }
    Ok(out)
}
