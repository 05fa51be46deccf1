use std::{
    error::Error,
    io::{self, Write},
    sync::{Arc, Mutex, PoisonError},
};

use clap::Parser;
use log::warn;
use sluice::{Canceller, ClientConfig, ExecutionHandle, Session};

/// Runs one statement against a sluice server and prints the rows.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server address
    #[arg(long, default_value = "127.0.0.1:7878")]
    address: String,
    /// Statement to execute
    statement: Option<String>,
    /// Submit asynchronously and poll for completion
    #[arg(long = "async")]
    run_async: bool,
    /// Print the `query_id:query_secret` identifier and exit without fetching rows
    #[arg(long)]
    serialize: bool,
    /// Fetch the rows of an earlier run instead of submitting
    #[arg(long, value_name = "QUERY_ID:QUERY_SECRET", conflicts_with = "statement")]
    resume: Option<String>,
    /// Disable staged (CloudFetch) results
    #[arg(long)]
    no_cloud_fetch: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = ClientConfig::new(&cli.address)
        .with_run_async(cli.run_async || cli.serialize)
        .with_cloud_fetch(!cli.no_cloud_fetch);
    let session = Session::connect_tcp(config);

    let canceller: Arc<Mutex<Option<Canceller>>> = Arc::new(Mutex::new(None));
    {
        let canceller = Arc::clone(&canceller);
        ctrlc::set_handler(move || {
            let current = canceller
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            match current {
                Some(canceller) => {
                    if let Err(e) = canceller.cancel() {
                        warn!("cancel failed: {e}");
                    }
                }
                None => std::process::exit(130),
            }
        })?;
    }

    let mut handle: ExecutionHandle = match (&cli.resume, &cli.statement) {
        (Some(serialized), _) => session.resume_serialized(serialized)?,
        (None, Some(statement)) => session.execute(statement, &[])?,
        (None, None) => return Err("either a statement or --resume is required".into()),
    };
    if cli.serialize {
        println!("{}", handle.detach()?);
        return Ok(());
    }
    *canceller.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle.canceller());

    let results = handle.get_results()?;
    let mut stdout = io::stdout().lock();
    let header: Vec<&str> = results.columns().iter().map(|c| c.name.as_str()).collect();
    writeln!(stdout, "{}", header.join("\t"))?;

    let mut count = 0u64;
    for row in results {
        let row = row?;
        let cells: Vec<String> = row.iter().map(ToString::to_string).collect();
        writeln!(stdout, "{}", cells.join("\t"))?;
        count += 1;
    }
    writeln!(stdout, "({count} rows)")?;

    handle.close();
    session.close();
    Ok(())
}
