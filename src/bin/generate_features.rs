use std::time::Instant;

use propensity::{
    init_logging, log_app_finish, log_app_start, log_pipeline_config, logging_config_from_env,
    pipeline_config_from_env, run_feature_pipeline, SqliteStore,
};

const APP: &str = "generate_features";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let started = Instant::now();
    let logging_cfg = logging_config_from_env()?;
    init_logging(&logging_cfg)?;
    log_app_start(APP, &logging_cfg);

    let cfg = pipeline_config_from_env()?;
    log_pipeline_config(APP, &cfg);

    let store = SqliteStore::open(&cfg.store_path, &cfg.feature_table)?;
    let report = run_feature_pipeline(&store, &store, &cfg)?;

    for anchor in &report.anchors {
        println!(
            "{} snapshot_transactions={} rows={} columns={}",
            anchor.anchor_day, anchor.snapshot_transactions, anchor.rows_written, anchor.columns
        );
    }
    println!(
        "wrote {} anchor days to {}",
        report.anchors.len(),
        store.feature_table()
    );
    log_app_finish(APP, started.elapsed().as_millis());

    Ok(())
}
