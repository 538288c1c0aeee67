use std::path::Path;

use anyhow::Context;

use tether_session::{ResponseStrategy, Table};
use tether_types::EngineOverrides;

use super::{open_session, Global};

/// Load a tab-separated file into `libref.table`.
pub fn run(global: &Global, libref: &str, table: &str, file: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let data = Table::from_tsv(&text)
        .with_context(|| format!("failed to parse {}", file.display()))?;

    let mut session = open_session(global, &EngineOverrides::default(), ResponseStrategy::Policy)?;
    let output = session
        .import_table(libref, table, &data)
        .with_context(|| format!("failed to import {libref}.{table}"))?;
    eprint!("{}", output.log);
    println!("imported {} rows into {libref}.{table}", data.len());

    session.terminate().context("failed to shut down engine")?;
    Ok(())
}
