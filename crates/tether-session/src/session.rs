//! The caller-facing session: one engine process, one submission at a time.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use tether_types::{EngineConfig, SessionConfig, TetherError, TimingConfig};

use crate::attention::{self, AttentionReport, CancelFlag, Disposition};
use crate::drain::{self, Accumulator, CompletionDetector, Poll};
use crate::framing::{self, ResultsMode, Token};
use crate::process::{EngineProcess, ExitState};
use crate::prompts::ResponseStrategy;
use crate::streams::EngineIo;

/// What one framed submission produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutput {
    /// This submission's log segment.
    pub log: String,
    /// Normalized results text.
    pub results: String,
    /// The token the submission was framed with.
    pub token: Token,
    /// Set when the submission was cancelled.
    pub attention: Option<AttentionReport>,
}

/// A running engine and the request/response protocol over it.
///
/// Once the engine is found dead every operation fails fast with
/// [`TetherError::ProcessTerminated`] without touching the streams.
pub struct Session<I: EngineIo = EngineProcess> {
    io: I,
    engine: EngineConfig,
    timing: TimingConfig,
    strategy: ResponseStrategy,
    last_token: Token,
    log: String,
    terminated: Option<String>,
}

impl Session<EngineProcess> {
    /// Launch the engine and run the housekeeping unit.
    pub fn start(config: SessionConfig, strategy: ResponseStrategy) -> Result<Self, TetherError> {
        let io = EngineProcess::spawn(&config.engine)?;
        let mut session = Session::attach(io, config, strategy);
        session.boot()?;
        Ok(session)
    }
}

impl<I: EngineIo> Session<I> {
    /// Wrap already-running streams. No housekeeping is run.
    pub(crate) fn attach(io: I, config: SessionConfig, strategy: ResponseStrategy) -> Self {
        Self {
            io,
            engine: config.engine,
            timing: config.timing,
            strategy,
            last_token: Token::default(),
            log: String::new(),
            terminated: None,
        }
    }

    /// Run the housekeeping unit so boot banners never reach a caller.
    pub(crate) fn boot(&mut self) -> Result<(), TetherError> {
        match self.submit(framing::HOUSEKEEPING_UNIT, ResultsMode::Text) {
            Ok(_) => {
                info!(pid = ?self.io.pid(), "engine session ready");
                Ok(())
            }
            Err(e) if self.io.exit_state() == Some(ExitState::LaunchFailed) => {
                Err(TetherError::StartupFailure(format!(
                    "could not launch {}: {e}",
                    self.engine.engine_path.display()
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Submit `code` and wait for its beacon.
    pub fn submit(&mut self, code: &str, mode: ResultsMode) -> Result<SubmitOutput, TetherError> {
        self.submit_cancellable(code, mode, &CancelFlag::new())
    }

    /// Submit `code`, running an attention episode whenever `cancel` is
    /// raised before the beacon arrives.
    pub fn submit_cancellable(
        &mut self,
        code: &str,
        mode: ResultsMode,
        cancel: &CancelFlag,
    ) -> Result<SubmitOutput, TetherError> {
        self.run_submission(code, mode, cancel, || Ok(()))
    }

    /// Like [`submit_cancellable`](Self::submit_cancellable), calling
    /// `each_cycle` once per poll cycle.
    pub(crate) fn run_submission<F>(
        &mut self,
        code: &str,
        mode: ResultsMode,
        cancel: &CancelFlag,
        mut each_cycle: F,
    ) -> Result<SubmitOutput, TetherError>
    where
        F: FnMut() -> Result<(), TetherError>,
    {
        self.ensure_running()?;
        let token = self.last_token.next();
        self.last_token = token;

        let framed = framing::frame(code, mode, token);
        debug!(%token, %mode, bytes = framed.len(), "submitting");
        if let Err(e) = self.io.write_input(&framed) {
            return Err(self.note_failure(e));
        }

        let mut detector = CompletionDetector::new(token, &self.timing);
        let attention = match self.drive(&mut detector, cancel, &mut each_cycle) {
            Ok(report) => report,
            Err(e) => {
                let partial = detector.finish();
                self.log.push_str(&partial.log_text());
                return Err(self.note_failure(e));
            }
        };

        let acc = detector.finish();
        let raw_log = acc.log_text();
        self.log.push_str(&raw_log);
        let output = SubmitOutput {
            log: drain::extract_log_segment(&raw_log, token),
            results: drain::normalize_results(&acc.results_text()),
            token,
            attention,
        };
        debug!(
            %token,
            log_bytes = output.log.len(),
            results_bytes = output.results.len(),
            "submission complete"
        );
        Ok(output)
    }

    fn drive<F>(
        &mut self,
        detector: &mut CompletionDetector,
        cancel: &CancelFlag,
        each_cycle: &mut F,
    ) -> Result<Option<AttentionReport>, TetherError>
    where
        F: FnMut() -> Result<(), TetherError>,
    {
        let token = detector.token();
        let remote = self.engine.is_remote();
        let mut report = None;
        loop {
            if cancel.take() && !detector.beacon_seen() {
                let mut partial = Accumulator::default();
                let episode = attention::run_episode(
                    &mut self.io,
                    token,
                    remote,
                    &mut self.strategy,
                    &self.timing,
                    cancel,
                    &mut partial,
                );
                detector.absorb(partial);
                let episode = episode?;
                if episode.disposition == Disposition::Aborted {
                    self.io.write_input(&framing::resync(token))?;
                }
                info!(
                    %token,
                    resolution = ?episode.resolution,
                    disposition = %episode.disposition,
                    "attention episode finished"
                );
                report = Some(episode);
                continue;
            }
            each_cycle()?;
            match detector.poll(&mut self.io)? {
                Poll::Complete => return Ok(report),
                Poll::Progress => {}
                Poll::Idle => thread::sleep(self.timing.idle_delay()),
            }
        }
    }

    /// Write `code` without guard or beacon and return the bytes written.
    pub fn asubmit(&mut self, code: &str, mode: ResultsMode) -> Result<usize, TetherError> {
        self.ensure_running()?;
        let framed = framing::frame_unguarded(code, mode);
        debug!(%mode, bytes = framed.len(), "submitting without beacon");
        match self.io.write_input(&framed) {
            Ok(()) => Ok(framed.len()),
            Err(e) => Err(self.note_failure(e)),
        }
    }

    /// Take whatever both streams hold right now into the session log,
    /// so an engine echoing a long run of input never fills its pipes.
    pub(crate) fn absorb_pending(&mut self) -> Result<(), TetherError> {
        self.ensure_running()?;
        let acc = drain::drain_available(&mut self.io, &self.timing)
            .map_err(|e| self.note_failure(e))?;
        if !acc.results.is_empty() {
            debug!(bytes = acc.results.len(), "discarding results while streaming input");
        }
        self.log.push_str(&acc.log_text());
        Ok(())
    }

    /// Everything the engine has logged in this session.
    pub fn log(&self) -> &str {
        &self.log
    }

    /// Read whatever the log holds now, waiting up to `wait` for something
    /// to arrive.
    pub fn read_log(&mut self, wait: Duration) -> Result<String, TetherError> {
        self.ensure_running()?;
        let text = match drain::drain_log(&mut self.io, &self.timing, wait) {
            Ok(text) => text,
            Err(e) => return Err(self.note_failure(e)),
        };
        let beacon = format!("{}{}", self.last_token.directive(), self.last_token.echo());
        let text = text.replace(&beacon, " ");
        self.log.push_str(&text);
        self.is_alive();
        Ok(text)
    }

    /// Read a complete markup listing from the results stream.
    pub fn read_listing(&mut self, wait: Duration) -> Result<String, TetherError> {
        self.ensure_running()?;
        drain::drain_listing(&mut self.io, &self.timing, wait).map_err(|e| self.note_failure(e))
    }

    /// Capture the plain listing produced so far.
    pub fn listing_text(&mut self, wait: Duration) -> Result<String, TetherError> {
        self.asubmit(&framing::listing_marker_step(), ResultsMode::Text)?;
        let text = drain::drain_listing_text(
            &mut self.io,
            &self.timing,
            framing::LISTING_MARKER,
            wait,
        )
        .map_err(|e| self.note_failure(e))?;
        // the marker step's own log lines
        let noise = drain::drain_log(&mut self.io, &self.timing, Duration::ZERO)
            .map_err(|e| self.note_failure(e))?;
        self.log.push_str(&noise);
        Ok(text)
    }

    /// Zero-wait liveness check.
    pub fn is_alive(&mut self) -> bool {
        if self.terminated.is_some() {
            return false;
        }
        if self.io.is_alive() {
            return true;
        }
        let reason = drain::terminated(&self.io).to_string();
        self.mark_terminated(reason);
        false
    }

    pub fn pid(&self) -> Option<u32> {
        self.io.pid()
    }

    /// Framed submissions so far, housekeeping included.
    pub fn submission_count(&self) -> u64 {
        self.last_token.value()
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    /// Ask the engine to exit, killing it if it is still running after the
    /// grace period.
    pub fn terminate(&mut self) -> Result<ExitState, TetherError> {
        if !self.is_alive() {
            return Ok(self.io.exit_state().unwrap_or(ExitState::Vanished));
        }
        info!(pid = ?self.io.pid(), "shutting down engine");

        let tail = drain::drain_log(&mut self.io, &self.timing, self.timing.log_poll())
            .map_err(|e| self.note_failure(e))?;
        self.log.push_str(&tail);
        let shutdown = framing::frame_unguarded(framing::SHUTDOWN_UNIT, ResultsMode::Text);
        if let Err(e) = self.io.write_input(&shutdown) {
            debug!(error = %e, "shutdown unit not delivered");
        }

        let deadline = Instant::now() + self.timing.shutdown_grace();
        while self.io.is_alive() {
            if Instant::now() >= deadline {
                warn!(pid = ?self.io.pid(), "engine ignored shutdown, killing");
                self.io.kill()?;
                break;
            }
            thread::sleep(self.timing.kill_poll());
        }
        if let Ok(rest) = drain::drain_log(&mut self.io, &self.timing, Duration::ZERO) {
            self.log.push_str(&rest);
        }

        let state = self.io.exit_state().unwrap_or(ExitState::Vanished);
        self.mark_terminated(format!("session terminated: engine {state}"));
        Ok(state)
    }

    #[cfg(test)]
    pub(crate) fn io_mut(&mut self) -> &mut I {
        &mut self.io
    }

    pub(crate) fn ensure_running(&self) -> Result<(), TetherError> {
        match &self.terminated {
            Some(reason) => Err(TetherError::ProcessTerminated(reason.clone())),
            None => Ok(()),
        }
    }

    /// Record a terminal failure so later calls fail fast.
    pub(crate) fn note_failure(&mut self, err: TetherError) -> TetherError {
        let err = match err {
            TetherError::Io(msg) if !self.io.is_alive() => {
                TetherError::ProcessTerminated(format!("{msg} ({})", drain::terminated(&self.io)))
            }
            other => other,
        };
        if let TetherError::ProcessTerminated(reason) = &err {
            self.mark_terminated(reason.clone());
        }
        err
    }

    fn mark_terminated(&mut self, reason: String) {
        if self.terminated.is_none() {
            warn!(reason = %reason, "engine session terminated");
            self.terminated = Some(reason);
        }
    }
}

impl<I: EngineIo> Drop for Session<I> {
    fn drop(&mut self) {
        if self.terminated.is_none() {
            if let Err(e) = self.terminate() {
                debug!(error = %e, "terminate on drop failed");
            }
        }
    }
}
