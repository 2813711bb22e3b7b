//! Tests for custom stage registration

use chrono::{TimeZone, Utc};
use flowmaster::core::{PeriodWindow, ResourcePool, StageError};
use flowmaster::flow::{
    Export, ExportBatch, ExportItem, FlowEnv, FlowRun, Load, Notebook, Row, StagePools, StageRegistry, TransformedBatch,
};
use flowmaster::infra::{FlowStatus, InMemoryLedger, LedgerStore};
use flowmaster::util::ManualClock;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

struct OneBatch {
    sent: bool,
    marker: String,
}

impl Export for OneBatch {
    fn next_item(&mut self) -> Result<Option<ExportItem>, StageError> {
        if std::mem::replace(&mut self.sent, true) {
            return Ok(None);
        }
        let mut row = Row::new();
        row.insert("marker".into(), Value::from(self.marker.clone()));
        row.insert("missing".into(), Value::Null);
        Ok(Some(ExportItem::Batch(ExportBatch {
            columns: vec!["marker".into()],
            rows: vec![row],
            ..ExportBatch::default()
        })))
    }
}

struct Collect(Arc<Mutex<Vec<TransformedBatch>>>);

impl Load for Collect {
    fn load(&mut self, batch: &TransformedBatch) -> Result<(), StageError> {
        self.0.lock().push(batch.clone());
        Ok(())
    }
}

#[test]
fn test_custom_provider_and_storage_run_end_to_end() {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let mut registry = StageRegistry::new();
    registry.register_export("api", |ctx| {
        let marker = ctx.param::<String>("marker").unwrap_or_default();
        Ok(Box::new(OneBatch { sent: false, marker }) as Box<dyn Export>)
    });
    let sink = Arc::clone(&collected);
    registry.register_load("sink", move |_ctx| Ok(Box::new(Collect(Arc::clone(&sink))) as Box<dyn Load>));

    let notebook: Notebook = serde_json::from_value(json!({
        "name": "custom",
        "provider": "api",
        "storage": "sink",
        "work": {"schedule": {"interval": "hourly", "timezone": "Europe/Berlin", "start_time": "00:00"}},
        "export": {"marker": "abc"},
    }))
    .unwrap();

    let period = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
    let ledger = Arc::new(InMemoryLedger::new());
    let env = FlowEnv {
        ledger: ledger.clone(),
        registry: Arc::new(registry),
        pool: Arc::new(ResourcePool::new()),
        clock: Arc::new(ManualClock::new(period)),
        storage_dir: std::env::temp_dir(),
        logs_dir: None,
    };
    let window = PeriodWindow {
        start: period,
        end: period,
        periods: vec![period],
    };
    let pools = StagePools::for_notebook(&notebook, &env.pool);
    FlowRun::new(&notebook, window, pools, env)
        .into_task(&notebook, None)
        .run_to_completion()
        .unwrap();

    let batches = collected.lock();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].rows[0]["marker"], json!("abc"));
    assert_eq!(ledger.get("custom", period).unwrap().unwrap().status, FlowStatus::Success);
}
