//! Cancellation of an in-flight submission.
//!
//! An attention episode interrupts the engine and then works through
//! whatever it does next: ask a question on the results stream, or finish
//! the step anyway and echo the beacon. Prompt answers come from a
//! [`ResponseStrategy`], so the same loop serves interactive callers and
//! unattended ones.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use tether_types::{TetherError, TimingConfig};

use crate::drain::{find_bytes, terminated, Accumulator};
use crate::framing::Token;
use crate::prompts::{self, RemoteChoice, ResponseKind, ResponseStrategy, Scan};
use crate::streams::EngineIo;

/// Cancellation request shared with whoever may cancel (a signal handler,
/// another thread).
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Consume a pending request.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// How an episode ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The beacon showed up on the log: the step finished.
    StepFinished,
    /// A prompt was answered with a cancelling choice.
    PromptAnswered,
    /// Over a remote shell the caller chose to continue; nothing was sent.
    RemoteContinue,
}

/// What the episode means for the submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Aborted,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Continue => f.write_str("continue"),
            Disposition::Aborted => f.write_str("aborted"),
        }
    }
}

/// Summary of an attention episode, returned with the submission output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionReport {
    pub resolution: Resolution,
    pub disposition: Disposition,
    /// The last prompt the engine asked, if any.
    pub prompt: Option<String>,
    /// The answer written for it.
    pub response: Option<String>,
}

impl AttentionReport {
    pub fn aborted(&self) -> bool {
        self.disposition == Disposition::Aborted
    }
}

/// Run one attention episode for the submission carrying `token`.
///
/// Everything read from the engine goes into `partial`, including when the
/// episode fails. A cancellation raised while the episode runs interrupts
/// the engine again.
pub fn run_episode<I: EngineIo + ?Sized>(
    io: &mut I,
    token: Token,
    remote: bool,
    strategy: &mut ResponseStrategy,
    timing: &TimingConfig,
    cancel: &CancelFlag,
    partial: &mut Accumulator,
) -> Result<AttentionReport, TetherError> {
    if !signal_engine(io, token, remote, strategy, timing)? {
        info!(%token, "remote attention declined, continuing");
        return Ok(AttentionReport {
            resolution: Resolution::RemoteContinue,
            disposition: Disposition::Continue,
            prompt: None,
            response: None,
        });
    }

    let echo = token.echo().into_bytes();
    let mut buf = vec![0; timing.read_chunk.max(1)];
    let mut pending = String::new();
    let mut prompt = None;
    let mut response = None;

    loop {
        if !io.is_alive() {
            partial.results.extend_from_slice(pending.as_bytes());
            return Err(terminated(io));
        }

        if cancel.take() {
            info!(%token, "cancel raised again during attention");
            signal_engine(io, token, remote, strategy, timing)?;
            continue;
        }

        let n = io.read_results(&mut buf)?;
        if n > 0 {
            pending.push_str(&String::from_utf8_lossy(&buf[..n]));
            match prompts::scan(&pending) {
                Scan::Nothing => {
                    partial.results.extend_from_slice(pending.as_bytes());
                    pending.clear();
                }
                Scan::Incomplete => {}
                Scan::Unknown(text) => {
                    warn!(%token, "unrecognized attention prompt");
                    partial.results.extend_from_slice(pending.as_bytes());
                    return Err(TetherError::UnknownPrompt(text));
                }
                Scan::Prompt(found) => {
                    let answer = strategy.answer(&found)?;
                    io.write_input(format!("{answer}\n").as_bytes())?;
                    info!(%token, prompt = %found.kind, response = %answer, "answered attention prompt");
                    let kind = prompts::classify(&found, &answer);
                    pending.clear();
                    prompt = Some(found.question);
                    response = Some(answer);
                    if kind == ResponseKind::Abort {
                        return Ok(AttentionReport {
                            resolution: Resolution::PromptAnswered,
                            disposition: Disposition::Aborted,
                            prompt,
                            response,
                        });
                    }
                }
            }
            continue;
        }

        let n = io.read_log(&mut buf)?;
        if n > 0 {
            partial.log.extend_from_slice(&buf[..n]);
            if find_bytes(&partial.log, &echo).is_some() {
                debug!(%token, "step finished during attention");
                partial.results.extend_from_slice(pending.as_bytes());
                return Ok(AttentionReport {
                    resolution: Resolution::StepFinished,
                    disposition: Disposition::Continue,
                    prompt,
                    response,
                });
            }
            continue;
        }

        thread::sleep(timing.attention_poll());
    }
}

/// Interrupt the engine and give it a moment to start prompting.
///
/// Over a remote shell the caller picks first; `false` means they chose to
/// let the step run on and nothing was sent.
fn signal_engine<I: EngineIo + ?Sized>(
    io: &mut I,
    token: Token,
    remote: bool,
    strategy: &mut ResponseStrategy,
    timing: &TimingConfig,
) -> Result<bool, TetherError> {
    if remote && strategy.remote_choice()? == RemoteChoice::Continue {
        return Ok(false);
    }
    info!(%token, "interrupting engine");
    io.interrupt()?;
    thread::sleep(timing.attention_pause());
    Ok(true)
}
