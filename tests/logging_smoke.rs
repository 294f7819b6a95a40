use std::fs;
use std::io;
use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use propensity::{
    build_feature_set, compute_features, load_adjusted_transactions, log_app_finish,
    log_app_start, log_pipeline_config, run_feature_pipeline, FeatureOptions, FeatureSink,
    LoggingConfig, PipelineConfig, SqliteStore, Transaction, WindowKind, PRODUCTS_FILE,
    TRANSACTIONS_FILE,
};
use tempfile::tempdir;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn sample_transactions() -> Vec<Transaction> {
    let base = NaiveDate::from_ymd_opt(2019, 12, 12).expect("valid date");
    [(1, "SOUP"), (1, "BEEF"), (2, "SOUP")]
        .into_iter()
        .enumerate()
        .map(|(idx, (household_key, commodity))| Transaction {
            household_key,
            basket_id: 10 + idx as i64,
            product_id: 100 + idx as i64,
            commodity_desc: commodity.to_string(),
            day: base,
            week_no: 102,
            store_id: 1,
            trans_time: 1200,
            amount_list: 0.0,
            instore_discount: 0.0,
            campaign_coupon_discount: 0.0,
            manuf_coupon_discount: 0.0,
            manuf_coupon_match_discount: 0.0,
            total_coupon_discount: 0.0,
            amount_paid: 1.0,
            units: 1,
        })
        .collect()
}

#[test]
fn feature_computation_logs_start_and_finish() {
    let logs = capture_logs(Level::INFO, || {
        compute_features(&sample_transactions(), true, WindowKind::Last90Days)
            .expect("features should compute");
    });

    assert!(logs.contains("\"event\":\"features.compute.start\""));
    assert!(logs.contains("\"event\":\"features.compute.finish\""));
    assert!(logs.contains("\"window\":\"90d\""));
    assert!(logs.contains("\"grouping\":\"household_category\""));
    assert!(!logs.contains("\"event\":\"features.schema.built\""));
}

#[test]
fn debug_level_reports_schema_and_non_finite_cells() {
    let logs = capture_logs(Level::DEBUG, || {
        build_feature_set(
            &sample_transactions(),
            NaiveDate::from_ymd_opt(2019, 12, 12).expect("valid date"),
            &[WindowKind::Last30Days],
            &FeatureOptions::default(),
        )
        .expect("feature set should build");
    });

    assert!(logs.contains("\"event\":\"features.schema.built\""));
    assert!(logs.contains("\"event\":\"features.compute.non_finite\""));
    assert!(logs.contains("\"event\":\"feature_set.merge\""));
}

#[test]
fn pipeline_and_store_emit_lifecycle_events() {
    let logs = capture_logs(Level::INFO, || {
        let store = SqliteStore::open_in_memory("propensity_features").expect("open store");
        store
            .replace_transactions(&sample_transactions())
            .expect("seed transactions");
        let cfg = PipelineConfig {
            anchor_day_count: 1,
            windows: vec![WindowKind::Last30Days],
            ..PipelineConfig::default()
        };
        run_feature_pipeline(&store, &store, &cfg).expect("pipeline should run");

        let table = store
            .read_features(NaiveDate::from_ymd_opt(2019, 12, 12).expect("valid date"))
            .expect("stored features");
        store
            .write_features(
                NaiveDate::from_ymd_opt(2019, 12, 12).expect("valid date"),
                &table,
            )
            .expect("rewrite features");
    });

    assert!(logs.contains("\"event\":\"store.transactions.replaced\""));
    assert!(logs.contains("\"event\":\"store.features.created\""));
    assert!(logs.contains("\"event\":\"store.features.written\""));
    assert!(logs.contains("\"event\":\"pipeline.start\""));
    assert!(logs.contains("\"event\":\"pipeline.anchor.finish\""));
    assert!(logs.contains("\"event\":\"pipeline.finish\""));
}

#[test]
fn transaction_load_logs_bounds() {
    let tmp = tempdir().expect("temp dir should be created");
    fs::write(
        tmp.path().join(PRODUCTS_FILE),
        "PRODUCT_ID,COMMODITY_DESC\n25671,FRZN ICE\n",
    )
    .expect("write catalog");
    fs::write(
        tmp.path().join(TRANSACTIONS_FILE),
        "household_key,BASKET_ID,DAY,PRODUCT_ID,QUANTITY,SALES_VALUE,STORE_ID,RETAIL_DISC,TRANS_TIME,WEEK_NO,COUPON_DISC,COUPON_MATCH_DISC\n\
         2375,1,1,25671,1,2.0,364,0,1631,1,0,0\n",
    )
    .expect("write transactions");

    let logs = capture_logs(Level::INFO, || {
        load_adjusted_transactions(
            tmp.path(),
            NaiveDate::from_ymd_opt(2018, 1, 1).expect("valid date"),
        )
        .expect("fixture should load");
    });

    assert!(logs.contains("\"event\":\"transactions.load.start\""));
    assert!(logs.contains("\"event\":\"transactions.load.finish\""));
    assert!(logs.contains("\"min_day\":\"2018-01-01\""));
}

#[test]
fn app_lifecycle_helpers_emit_baseline_events() {
    let logs = capture_logs(Level::INFO, || {
        log_app_start("generate_features", &LoggingConfig::default());
        log_pipeline_config("generate_features", &PipelineConfig::default());
        log_app_finish("generate_features", 42);
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"event\":\"app.config\""));
    assert!(logs.contains("\"event\":\"app.finish\""));
    assert!(logs.contains("\"component\":\"generate_features\""));
}
