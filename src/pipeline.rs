//! Per-anchor-day feature generation.
//!
//! Each anchor day simulates the dataset as it looked on that day: the
//! snapshot keeps transactions up to and including the anchor, every window
//! is computed for both grouping modes, and the merged set is written to the
//! sink under the anchor day.

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::PipelineConfig;
use crate::feature_set::{assemble_feature_set, merge_feature_tables, FeatureSetError};
use crate::features::{compute_features_with, FeatureError, FeatureOptions, FeatureTable};
use crate::store::{FeatureSink, StoreError, TransactionSource};
use crate::transactions::{dataset_bounds, Transaction};
use crate::window::WindowKind;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    FeatureSet(#[from] FeatureSetError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no feature windows configured")]
    NoWindows,
    #[error("anchor day count must be > 0")]
    NoAnchorDays,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorReport {
    pub anchor_day: NaiveDate,
    pub snapshot_transactions: u64,
    pub rows_written: u64,
    pub columns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub source_transactions: u64,
    pub anchors: Vec<AnchorReport>,
}

/// The last `count` days of the dataset, ascending, never before its first day.
pub fn anchor_days(
    transactions: &[Transaction],
    count: u32,
) -> Result<Vec<NaiveDate>, FeatureError> {
    let bounds = dataset_bounds(transactions).ok_or(FeatureError::EmptyDataset)?;
    let mut out: Vec<NaiveDate> = (0..u64::from(count))
        .map_while(|offset| bounds.max_day.checked_sub_days(Days::new(offset)))
        .take_while(|day| *day >= bounds.min_day)
        .collect();
    out.reverse();
    Ok(out)
}

pub fn snapshot(transactions: &[Transaction], anchor_day: NaiveDate) -> Vec<Transaction> {
    transactions
        .iter()
        .filter(|txn| txn.day <= anchor_day)
        .cloned()
        .collect()
}

/// Household+category rows carrying every window's category and household features.
pub fn build_feature_set(
    transactions: &[Transaction],
    anchor_day: NaiveDate,
    windows: &[WindowKind],
    options: &FeatureOptions,
) -> Result<FeatureTable, PipelineError> {
    if windows.is_empty() {
        return Err(PipelineError::NoWindows);
    }

    let snapshot = snapshot(transactions, anchor_day);
    let mut household = Vec::with_capacity(windows.len());
    let mut household_category = Vec::with_capacity(windows.len());
    for window in windows {
        household.push(compute_features_with(&snapshot, false, *window, options)?);
        household_category.push(compute_features_with(&snapshot, true, *window, options)?);
    }

    let household = merge_feature_tables(&household)?;
    let household_category = merge_feature_tables(&household_category)?;
    Ok(assemble_feature_set(&household, &household_category)?)
}

pub fn run_feature_pipeline(
    source: &dyn TransactionSource,
    sink: &dyn FeatureSink,
    cfg: &PipelineConfig,
) -> Result<PipelineReport, PipelineError> {
    if cfg.anchor_day_count == 0 {
        return Err(PipelineError::NoAnchorDays);
    }
    if cfg.windows.is_empty() {
        return Err(PipelineError::NoWindows);
    }

    let transactions = source.load_transactions()?;
    let anchors = anchor_days(&transactions, cfg.anchor_day_count)?;

    info!(
        component = "pipeline",
        event = "pipeline.start",
        transactions = transactions.len(),
        anchors = anchors.len(),
        first_anchor = ?anchors.first(),
        last_anchor = ?anchors.last()
    );

    let mut report = PipelineReport {
        source_transactions: transactions.len() as u64,
        anchors: Vec::with_capacity(anchors.len()),
    };

    for anchor_day in anchors {
        let feature_set =
            build_feature_set(&transactions, anchor_day, &cfg.windows, &cfg.feature_options)?;
        let rows_written = sink.write_features(anchor_day, &feature_set)?;
        let snapshot_transactions = transactions
            .iter()
            .filter(|txn| txn.day <= anchor_day)
            .count() as u64;

        info!(
            component = "pipeline",
            event = "pipeline.anchor.finish",
            anchor_day = %anchor_day,
            snapshot_transactions = snapshot_transactions,
            rows_written = rows_written,
            columns = feature_set.schema.columns.len()
        );

        report.anchors.push(AnchorReport {
            anchor_day,
            snapshot_transactions,
            rows_written,
            columns: feature_set.schema.columns.len() as u64,
        });
    }

    info!(
        component = "pipeline",
        event = "pipeline.finish",
        anchors = report.anchors.len(),
        rows_written = report.anchors.iter().map(|a| a.rows_written).sum::<u64>()
    );

    Ok(report)
}
