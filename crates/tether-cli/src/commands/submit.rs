use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::info;

use tether_session::{AttentionReport, CancelFlag, ResponseStrategy, ResultsMode};
use tether_types::EngineOverrides;

use super::{open_session, Global, TerminalResponder};

#[derive(Debug, Clone)]
pub struct SubmitArgs {
    pub mode: ResultsMode,
    pub engine: Option<PathBuf>,
    pub options: Vec<String>,
    pub unattended: bool,
    pub file: PathBuf,
}

/// Run one program through a fresh engine session.
pub fn run(global: &Global, args: &SubmitArgs) -> anyhow::Result<()> {
    let code = read_program(&args.file)?;

    let overrides = EngineOverrides {
        engine_path: args.engine.clone(),
        options: (!args.options.is_empty()).then(|| args.options.clone()),
        ..EngineOverrides::default()
    };
    let strategy = if args.unattended {
        ResponseStrategy::Policy
    } else {
        ResponseStrategy::interactive(TerminalResponder)
    };
    let mut session = open_session(global, &overrides, strategy)?;

    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    ctrlc::set_handler(move || flag.cancel()).context("failed to set ctrl-c handler")?;

    let output = session
        .submit_cancellable(&code, args.mode, &cancel)
        .context("submission failed")?;

    eprint!("{}", output.log);
    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(output.results.as_bytes())
        .context("failed to write results")?;
    stdout.flush().context("failed to write results")?;

    if let Some(report) = &output.attention {
        eprintln!("{}", describe(report));
    }

    let exit = session.terminate().context("failed to shut down engine")?;
    info!(%exit, "engine exited");
    Ok(())
}

fn read_program(file: &Path) -> anyhow::Result<String> {
    if file.as_os_str() == "-" {
        let mut code = String::new();
        std::io::stdin()
            .read_to_string(&mut code)
            .context("failed to read program from stdin")?;
        Ok(code)
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("failed to read {}", file.display()))
    }
}

fn describe(report: &AttentionReport) -> String {
    match &report.response {
        Some(answer) => format!(
            "submission interrupted: {} (answered {answer:?})",
            report.disposition
        ),
        None => format!("submission interrupted: {}", report.disposition),
    }
}
