use std::{error::Error, net::SocketAddr, path::PathBuf, sync::Arc};

use clap::Parser;
use log::info;
use sluice::{
    ColumnDescriptor, LogicalType, Table, Value, Warehouse, WarehouseConfig,
    protocol::WarehouseServer,
};

/// Serves an in-memory warehouse with a demo table.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for new connections at address
    #[arg(long, default_value = "127.0.0.1:7878")]
    address: SocketAddr,
    /// Directory for staged result files
    #[arg(long, default_value_os_t = std::env::temp_dir().join("sluice-staging"))]
    staging_dir: PathBuf,
    /// Rows in the `SELECT * FROM demo` result
    #[arg(long, default_value_t = 250_000)]
    demo_rows: i64,
    /// Rows per staged file
    #[arg(long, default_value_t = 20_000)]
    rows_per_file: u64,
    /// Status polls answered RUNNING before a run finishes
    #[arg(long, default_value_t = 0)]
    polls: u32,
}

fn demo_table(rows: i64) -> Table {
    Table::new(
        vec![
            ColumnDescriptor::new("id", LogicalType::BigInt, false),
            ColumnDescriptor::new("label", LogicalType::String, true),
            ColumnDescriptor::new("score", LogicalType::Double, true),
        ],
        (0..rows)
            .map(|i| {
                vec![
                    Value::Int(i),
                    if i % 7 == 0 {
                        Value::Null
                    } else {
                        Value::Text(format!("row-{i}"))
                    },
                    Value::Float(i as f64 / 3.0),
                ]
            })
            .collect(),
    )
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = WarehouseConfig::default()
        .with_staging_dir(&cli.staging_dir)
        .with_rows_per_file(cli.rows_per_file)
        .with_polls_until_finished(cli.polls);
    let warehouse = Warehouse::new(config);

    warehouse.register("SELECT 1", demo_table(1));
    warehouse.register("SELECT * FROM demo", demo_table(cli.demo_rows));
    warehouse.register_failure(
        "SELECT 1/0",
        "DIVIDE_BY_ZERO",
        "Division by zero in expression 1/0",
    );
    info!(
        "registered demo statements, staging in {}",
        cli.staging_dir.display()
    );

    let server = WarehouseServer::bind(cli.address, Arc::new(warehouse))?;
    server.listen()?;
    Ok(())
}
