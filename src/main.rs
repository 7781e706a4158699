use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use onion_sql::config::{parse_master_key, ProxyConfig};
use onion_sql::onions::SecurityRating;
use onion_sql::proxy::{Proxy, RecordingConnection};
use onion_sql::query::load_statements;
use onion_sql::store::MemoryStore;
use onion_sql::tables::load_tables;

/// Prints the encrypted form of SQL statements run against CSV tables.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Directory of `<table>.csv` files with `name:type` headers
    #[arg(long)]
    tables: PathBuf,
    /// File of SQL statements, `-` for standard input
    #[arg(long)]
    query: PathBuf,
    /// 64 hexadecimal digits. A random key is drawn if absent.
    #[arg(long)]
    master_key: Option<String>,
    /// Store the tables unencrypted
    #[arg(long)]
    plain: bool,
    /// Log filter, e.g. `onion_sql=debug`
    #[arg(long)]
    log: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter = match &args.log {
        Some(directives) => EnvFilter::try_new(directives)?,
        None => EnvFilter::from_default_env().add_directive("onion_sql=info".parse()?),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.master_key {
        Some(key) => ProxyConfig::with_master_key(parse_master_key(key)?),
        None => ProxyConfig::default(),
    };
    if args.plain {
        config.default_rating = SecurityRating::Plain;
    }

    let proxy = Proxy::new(config, RecordingConnection::new(), Box::new(MemoryStore::new()))?;
    proxy.bootstrap()?;
    for (name, table) in load_tables(&args.tables)? {
        proxy.execute(&table.create_statement(&name))?;
        if let Some(insert) = table.insert_statement(&name) {
            proxy.execute(&insert)?;
        }
        info!(table = %name, rows = table.content.len(), "table loaded");
    }
    proxy.with_connection(|c| c.take_statements());

    for statement in load_statements(&args.query)? {
        println!("-- {statement}");
        if let Err(e) = proxy.execute_statement(&statement) {
            warn!(%statement, error = %e, "statement failed");
            println!("-- error: {e}");
        }
        for sql in proxy.with_connection(|c| c.take_statements()) {
            println!("{sql};");
        }
    }
    Ok(())
}
