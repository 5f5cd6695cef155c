use std::sync::Arc;

use clap::Parser;
use rand::{
    distributions::{Alphanumeric, DistString},
    Rng, SeedableRng,
};
use tracing::info;

use tablediff::memory::InMemoryTable;
use tablediff::{ColumnType, DiffError, DiffOptions, HashDiffer, Value};

/// Demo: seed two in-memory tables with a few injected differences and diff
/// them.
#[derive(Parser)]
struct Args {
    /// Rows in each table.
    #[arg(long, default_value_t = 10_000)]
    rows: i64,
    /// Rows updated in table B.
    #[arg(long, default_value_t = 7)]
    updated: i64,
    /// Rows present only in table B.
    #[arg(long, default_value_t = 3)]
    exclusive: i64,
    #[arg(long, default_value_t = 8)]
    bisection_factor: usize,
    #[arg(long, default_value_t = 1024)]
    bisection_threshold: u64,
    #[arg(long, default_value_t = 8)]
    threads: usize,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(short, long, default_value_t = tracing::Level::INFO)]
    log_level: tracing::Level,
}

#[tokio::main]
async fn main() -> Result<(), DiffError> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_max_level(args.log_level).init();

    let mut rng = rand::rngs::StdRng::seed_from_u64(args.seed);
    let base: Vec<Vec<Value>> = (0..args.rows)
        .map(|id| {
            vec![
                Value::Int(id),
                Value::Int(rng.gen_range(0..1000)),
                Value::Text(Alphanumeric.sample_string(&mut rng, 12)),
            ]
        })
        .collect();

    let columns = vec![
        ("id", ColumnType::Integer),
        ("value", ColumnType::Integer),
        ("note", ColumnType::Text),
    ];
    let table_a = Arc::new(InMemoryTable::new("table_a", columns.clone()));
    table_a.insert_rows(base.clone());

    let mut rows_b = base;
    for _ in 0..args.updated {
        let victim = rng.gen_range(0..args.rows) as usize;
        rows_b[victim][1] = Value::Int(rng.gen_range(1000..2000));
    }
    for extra in 0..args.exclusive {
        rows_b.push(vec![
            Value::Int(args.rows + extra),
            Value::Int(rng.gen_range(0..1000)),
            Value::Text(Alphanumeric.sample_string(&mut rng, 12)),
        ]);
    }
    let table_b = Arc::new(InMemoryTable::new("table_b", columns));
    table_b.insert_rows(rows_b);

    let differ = HashDiffer::new(DiffOptions {
        bisection_factor: args.bisection_factor,
        bisection_threshold: args.bisection_threshold,
        threaded: args.threads > 1,
        max_threadpool_size: args.threads,
        ..DiffOptions::default()
    })?;

    info!("diffing {} rows per side", args.rows);
    let mut stream = differ
        .diff_tables(
            table_a.segment(&["id"], &["value", "note"]),
            table_b.segment(&["id"], &["value", "note"]),
        )
        .await?;

    while let Some(entry) = stream.next().await {
        let (sign, row) = entry?;
        println!("{sign} {}", serde_json::to_string(&row).unwrap_or_default());
    }

    let summary = stream.summary().await?;
    println!("{} rows in table A", summary.rows_a);
    println!("{} rows in table B", summary.rows_b);
    println!("{} rows exclusive to table A (not present in B)", summary.exclusive_a);
    println!("{} rows exclusive to table B (not present in A)", summary.exclusive_b);
    println!("{} rows updated", summary.updated);
    println!("{} rows unchanged", summary.unchanged);
    println!("{:.2}% difference score", 100.0 * summary.diff_percent);
    if !summary.stats.is_empty() {
        println!("\nextra-info:");
        for (key, value) in &summary.stats {
            println!("  {key} = {value}");
        }
    }
    Ok(())
}
