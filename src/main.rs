//! Reads shoe records from stdin, one per line as
//! `code,info,size,Y|N,cost,sale,count,category`, and prints how many were
//! entered and their total profit. Blank lines are skipped.
//!
//! `RUST_LOG` controls logging, `INVTRACK_BYTE_LIMIT` caps tracked memory.

use std::{
    io::{self, BufRead},
    process::ExitCode,
};

use invtrack::{
    alloc::{PtrStack, TrackingAlloc, TrackingConfig},
    record::{self, Shoe},
};
use log::{debug, error};

fn run(alloc: &TrackingAlloc) -> Result<(), Box<dyn std::error::Error>> {
    let mut records = PtrStack::new(alloc);

    for (number, line) in io::stdin().lock().lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let shoe = Shoe::parse_line(&line).map_err(|e| format!("line {}: {e}", number + 1))?;
        records.append(record::store(alloc, &shoe)?)?;
    }

    debug!("tracked memory: {}", alloc.to_json()?);
    println!("RECORDS: {}", records.len());
    println!("TOTAL PROFIT: {}", record::total_profit(alloc, &records));
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    let config = match TrackingConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            eprintln!("invtrack: {e}");
            return ExitCode::FAILURE;
        }
    };
    let alloc = TrackingAlloc::with_config(config);

    let result = run(&alloc);
    alloc.release_all();
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("invtrack: {e}");
            ExitCode::FAILURE
        }
    }
}
