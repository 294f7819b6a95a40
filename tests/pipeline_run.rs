use std::cell::RefCell;
use std::path::PathBuf;

use chrono::NaiveDate;
use propensity::{
    anchor_days, build_feature_set, metric_names, run_feature_pipeline, FeatureError,
    FeatureOptions, FeatureSink, FeatureTable, GroupKey, PipelineConfig, PipelineError,
    SqliteStore, StoreError, Transaction, TransactionSource, WindowKind, ALL_WINDOWS,
};
use tempfile::tempdir;

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid test date")
}

fn line(household_key: i64, basket_id: i64, commodity: &str, day: NaiveDate) -> Transaction {
    Transaction {
        household_key,
        basket_id,
        product_id: basket_id * 10,
        commodity_desc: commodity.to_string(),
        day,
        week_no: 1,
        store_id: 1,
        trans_time: 1200,
        amount_list: 2.0,
        instore_discount: 0.0,
        campaign_coupon_discount: 0.0,
        manuf_coupon_discount: 0.0,
        manuf_coupon_match_discount: 0.0,
        total_coupon_discount: 0.0,
        amount_paid: 2.0,
        units: 1,
    }
}

fn december_transactions() -> Vec<Transaction> {
    (1..=12)
        .map(|d| {
            line(
                i64::from(d % 3),
                100 + i64::from(d),
                ["SOUP", "BEEF"][d as usize % 2],
                day(2019, 12, d),
            )
        })
        .collect()
}

struct VecSource(Vec<Transaction>);

impl TransactionSource for VecSource {
    fn load_transactions(&self) -> Result<Vec<Transaction>, StoreError> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
struct RecordingSink {
    writes: RefCell<Vec<(NaiveDate, FeatureTable)>>,
}

impl FeatureSink for RecordingSink {
    fn write_features(
        &self,
        anchor_day: NaiveDate,
        table: &FeatureTable,
    ) -> Result<u64, StoreError> {
        self.writes.borrow_mut().push((anchor_day, table.clone()));
        Ok(table.rows.len() as u64)
    }
}

fn config(anchor_day_count: u32, windows: Vec<WindowKind>) -> PipelineConfig {
    PipelineConfig {
        data_dir: PathBuf::from("unused"),
        anchor_day_count,
        windows,
        ..PipelineConfig::default()
    }
}

#[test]
fn anchor_days_are_the_trailing_dataset_days() {
    let txns = december_transactions();

    assert_eq!(
        anchor_days(&txns, 3).expect("anchors"),
        vec![day(2019, 12, 10), day(2019, 12, 11), day(2019, 12, 12)]
    );

    let clipped = anchor_days(&txns, 50).expect("clipped anchors");
    assert_eq!(clipped.len(), 12);
    assert_eq!(clipped[0], day(2019, 12, 1));

    assert!(matches!(anchor_days(&[], 3), Err(FeatureError::EmptyDataset)));
}

#[test]
fn feature_set_only_sees_its_snapshot() {
    let mut txns = december_transactions();
    txns.push(line(9, 900, "MILK", day(2019, 12, 20)));

    let anchor = day(2019, 12, 12);
    let set = build_feature_set(&txns, anchor, &ALL_WINDOWS, &FeatureOptions::default())
        .expect("feature set");

    assert_eq!(set.schema.columns.len(), metric_names().len() * 2 * ALL_WINDOWS.len());
    assert!(set.rows.iter().all(|row| row.key.household_key != 9));
    assert!(set.rows.iter().all(|row| row.key.commodity_desc.is_some()));

    // Household 1 bought on the anchor day; its 30d household days cover every purchase.
    let key = GroupKey::household_category(1, "BEEF");
    assert_eq!(set.value(&key, "days_30d"), Some(4.0));
    assert_eq!(set.value(&key, "days_cmd_30d"), Some(2.0));

    let later = build_feature_set(&txns, day(2019, 12, 20), &ALL_WINDOWS, &FeatureOptions::default())
        .expect("later feature set");
    assert!(later.rows.iter().any(|row| row.key.household_key == 9));

    assert!(matches!(
        build_feature_set(&txns, anchor, &[], &FeatureOptions::default()),
        Err(PipelineError::NoWindows)
    ));
}

#[test]
fn pipeline_writes_one_set_per_anchor_day() {
    let source = VecSource(december_transactions());
    let sink = RecordingSink::default();
    let cfg = config(3, vec![WindowKind::Last30Days, WindowKind::Anniversary30Days]);

    let report = run_feature_pipeline(&source, &sink, &cfg).expect("pipeline run");

    assert_eq!(report.source_transactions, 12);
    assert_eq!(report.anchors.len(), 3);
    let anchors: Vec<NaiveDate> = report.anchors.iter().map(|a| a.anchor_day).collect();
    assert_eq!(anchors, vec![day(2019, 12, 10), day(2019, 12, 11), day(2019, 12, 12)]);
    assert_eq!(
        report
            .anchors
            .iter()
            .map(|a| a.snapshot_transactions)
            .collect::<Vec<_>>(),
        vec![10, 11, 12]
    );

    let writes = sink.writes.borrow();
    assert_eq!(writes.len(), 3);
    for ((anchor_day, table), anchor_report) in writes.iter().zip(&report.anchors) {
        assert_eq!(*anchor_day, anchor_report.anchor_day);
        assert_eq!(table.rows.len() as u64, anchor_report.rows_written);
        assert_eq!(table.schema.columns.len() as u64, anchor_report.columns);
        assert_eq!(anchor_report.columns, 94 * 2 * 2);
    }
    assert_eq!(writes[0].1.schema.fingerprint, writes[2].1.schema.fingerprint);
}

#[test]
fn pipeline_runs_against_sqlite_store() {
    let tmp = tempdir().expect("temp dir should be created");
    let cfg = PipelineConfig {
        store_path: tmp.path().join("propensity.sqlite"),
        ..config(2, vec![WindowKind::Last30Days])
    };

    let store = SqliteStore::open(&cfg.store_path, &cfg.feature_table).expect("open store");
    store
        .replace_transactions(&december_transactions())
        .expect("seed transactions");

    let report = run_feature_pipeline(&store, &store, &cfg).expect("pipeline run");
    assert_eq!(report.anchors.len(), 2);
    assert_eq!(
        store.anchor_days().expect("stored anchors"),
        vec![day(2019, 12, 11), day(2019, 12, 12)]
    );

    let stored = store.read_features(day(2019, 12, 12)).expect("stored rows");
    assert_eq!(stored.rows.len() as u64, report.anchors[1].rows_written);

    // A second run replaces rows instead of appending.
    run_feature_pipeline(&store, &store, &cfg).expect("second run");
    let again = store.read_features(day(2019, 12, 12)).expect("stored rows");
    assert_eq!(again.rows.len(), stored.rows.len());
}

#[test]
fn pipeline_rejects_unusable_configs_and_empty_sources() {
    let sink = RecordingSink::default();
    let source = VecSource(december_transactions());

    assert!(matches!(
        run_feature_pipeline(&source, &sink, &config(0, ALL_WINDOWS.to_vec())),
        Err(PipelineError::NoAnchorDays)
    ));
    assert!(matches!(
        run_feature_pipeline(&source, &sink, &config(3, Vec::new())),
        Err(PipelineError::NoWindows)
    ));
    assert!(matches!(
        run_feature_pipeline(&VecSource(Vec::new()), &sink, &config(3, ALL_WINDOWS.to_vec())),
        Err(PipelineError::Feature(FeatureError::EmptyDataset))
    ));
    assert!(sink.writes.borrow().is_empty());
}
