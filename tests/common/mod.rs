#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use sluice::{
    ClientConfig, ColumnDescriptor, LocalTransport, LogicalType, RetryConfig, Row, Session,
    Table, Value, Warehouse, WarehouseConfig,
};
use tempdir::TempDir;

pub struct Fixture {
    pub session: Session,
    pub transport: Arc<LocalTransport>,
    pub warehouse: Arc<Warehouse>,
    pub dir: TempDir,
}

impl Fixture {
    pub fn new(
        warehouse: impl FnOnce(WarehouseConfig) -> WarehouseConfig,
        client: impl FnOnce(ClientConfig) -> ClientConfig,
    ) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = TempDir::new("sluice").unwrap();
        let warehouse = Arc::new(Warehouse::new(warehouse(
            WarehouseConfig::default().with_staging_dir(dir.path()),
        )));
        let transport = Arc::new(LocalTransport::new(Arc::clone(&warehouse)));
        let session = Self::session(&transport, client);
        Self {
            session,
            transport,
            warehouse,
            dir,
        }
    }

    /// Another session over the same warehouse.
    pub fn session(
        transport: &Arc<LocalTransport>,
        client: impl FnOnce(ClientConfig) -> ClientConfig,
    ) -> Session {
        let config = client(ClientConfig::new("local").with_retry(fast_retry()));
        Session::new(transport.clone(), config)
    }

    pub fn calls(&self) -> usize {
        self.transport.calls()
    }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig::default()
        .with_delay_min(Duration::from_millis(1))
        .with_delay_max(Duration::from_millis(5))
        .with_max_attempts(5)
}

pub fn numbers(rows: i64) -> Table {
    Table::new(
        vec![
            ColumnDescriptor::new("n", LogicalType::BigInt, false),
            ColumnDescriptor::new("label", LogicalType::String, true),
        ],
        (0..rows)
            .map(|i| vec![Value::Int(i), Value::Text(format!("n{i}"))])
            .collect(),
    )
}

pub fn ints(rows: &[Row]) -> Vec<i64> {
    rows.iter()
        .map(|row| match row[0] {
            Value::Int(i) => i,
            ref other => panic!("unexpected value {other:?}"),
        })
        .collect()
}
