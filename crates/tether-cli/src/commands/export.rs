use std::io::Write;

use anyhow::Context;

use tether_session::ResponseStrategy;
use tether_types::EngineOverrides;

use super::{open_session, Global};

/// Print `libref.table` to stdout as tab-separated text.
pub fn run(global: &Global, libref: &str, table: &str) -> anyhow::Result<()> {
    let mut session = open_session(global, &EngineOverrides::default(), ResponseStrategy::Policy)?;
    let data = session
        .export_table(libref, table)
        .with_context(|| format!("failed to export {libref}.{table}"))?;

    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(data.to_tsv().as_bytes())
        .context("failed to write table")?;
    stdout.flush().context("failed to write table")?;

    session.terminate().context("failed to shut down engine")?;
    Ok(())
}
