//! Dual-stream completion detection.
//!
//! The engine has no message boundaries, so a submission is complete when
//! its beacon echo shows up on the log stream. Both output pipes are
//! non-blocking; each poll cycle reads the results stream first and only
//! falls back to the log stream when results had nothing to offer.

use std::thread;
use std::time::Duration;

use tracing::debug;

use tether_types::{TetherError, TimingConfig};

use crate::framing::{Token, GUARD};
use crate::streams::EngineIo;

/// Search for `needle` in `haystack`.
pub(crate) fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// The terminal error for an engine that has gone away.
pub(crate) fn terminated<I: EngineIo + ?Sized>(io: &I) -> TetherError {
    match io.exit_state() {
        Some(state) => TetherError::ProcessTerminated(state.to_string()),
        None => TetherError::ProcessTerminated("engine is not running".into()),
    }
}

/// Bytes collected from the two output streams during one submission.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Accumulator {
    pub log: Vec<u8>,
    pub results: Vec<u8>,
}

impl Accumulator {
    pub fn log_text(&self) -> String {
        String::from_utf8_lossy(&self.log).into_owned()
    }

    pub fn results_text(&self) -> String {
        String::from_utf8_lossy(&self.results).into_owned()
    }
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// Bytes arrived on one of the streams.
    Progress,
    /// Nothing was available; the caller should idle before polling again.
    Idle,
    /// The beacon was seen and the trailing countdown has run out.
    Complete,
}

/// Per-submission drain state.
#[derive(Debug)]
pub struct CompletionDetector {
    token: Token,
    echo: Vec<u8>,
    acc: Accumulator,
    bail: bool,
    countdown: u32,
    buf: Vec<u8>,
}

impl CompletionDetector {
    pub fn new(token: Token, timing: &TimingConfig) -> Self {
        Self {
            token,
            echo: token.echo().into_bytes(),
            acc: Accumulator::default(),
            bail: false,
            countdown: timing.bail_countdown,
            buf: vec![0; timing.read_chunk.max(1)],
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Whether the beacon echo has been seen.
    pub fn beacon_seen(&self) -> bool {
        self.bail
    }

    /// Run one cycle: liveness, then results, then (only if results were
    /// empty) the log.
    pub fn poll<I: EngineIo + ?Sized>(&mut self, io: &mut I) -> Result<Poll, TetherError> {
        if !io.is_alive() {
            return Err(terminated(io));
        }

        let n = io.read_results(&mut self.buf)?;
        if n > 0 {
            self.acc.results.extend_from_slice(&self.buf[..n]);
            return Ok(Poll::Progress);
        }

        let n = io.read_log(&mut self.buf)?;
        if n > 0 {
            self.acc.log.extend_from_slice(&self.buf[..n]);
            self.check_beacon();
            return Ok(Poll::Progress);
        }

        if self.bail {
            if self.countdown == 0 {
                return Ok(Poll::Complete);
            }
            self.countdown -= 1;
        }
        Ok(Poll::Idle)
    }

    /// Fold bytes collected elsewhere (an attention episode) into this
    /// submission's accumulators.
    pub fn absorb(&mut self, partial: Accumulator) {
        self.acc.log.extend_from_slice(&partial.log);
        self.acc.results.extend_from_slice(&partial.results);
        self.check_beacon();
    }

    pub fn finish(self) -> Accumulator {
        self.acc
    }

    fn check_beacon(&mut self) {
        if !self.bail && find_bytes(&self.acc.log, &self.echo).is_some() {
            debug!(token = %self.token, "beacon observed");
            self.bail = true;
        }
    }
}

/// Cut this submission's log out of the raw log text.
///
/// The segment ends before the line that echoes the current beacon
/// directive and starts after the echo of the previous token. The guard
/// sequence is removed.
pub fn extract_log_segment(raw: &str, token: Token) -> String {
    let directive = token.directive();
    let before = match raw.find(&directive) {
        Some(i) => &raw[..i],
        None => raw,
    };
    let before = match before.rfind('\n') {
        Some(i) => &before[..i],
        None => "",
    };
    let start = format!("{}\n", token.previous().echo());
    let segment = match before.rfind(&start) {
        Some(i) => &before[i + start.len()..],
        None => before,
    };
    segment.replace(GUARD, "")
}

/// Tail left by the markup renderer when a step produced no output.
const EMPTY_MARKUP_TAIL: &str = "/*]]>*/";

/// Results shorter than this past the last [`EMPTY_MARKUP_TAIL`] carry no content.
const EMPTY_MARKUP_SLACK: usize = 100;

/// Normalize results text for callers.
pub fn normalize_results(results: &str) -> String {
    if let Some(i) = results.rfind(EMPTY_MARKUP_TAIL) {
        let tail = &results[i + EMPTY_MARKUP_TAIL.len()..];
        if tail.chars().count() < EMPTY_MARKUP_SLACK {
            return String::new();
        }
    }
    results
        .replace('\x0c', "\n")
        .replace("<body class=\"c body\">", "<body class=\"l body\">")
        .replace("font-size: x-small;", "font-size:  normal;")
}

/// Read whatever the log has right now.
///
/// Retries an empty log up to `wait / log_poll` times and stops at the
/// first empty read once something has arrived.
pub fn drain_log<I: EngineIo + ?Sized>(
    io: &mut I,
    timing: &TimingConfig,
    wait: Duration,
) -> Result<String, TetherError> {
    let mut buf = vec![0; timing.read_chunk.max(1)];
    let mut log = Vec::new();
    let mut retries = timing.retries_within(wait);
    loop {
        let n = io.read_log(&mut buf)?;
        if n > 0 {
            log.extend_from_slice(&buf[..n]);
            continue;
        }
        if !log.is_empty() {
            break;
        }
        retries -= 1;
        if retries == 0 {
            break;
        }
        thread::sleep(timing.log_poll());
    }
    Ok(String::from_utf8_lossy(&log).into_owned())
}

/// Read both streams until neither has anything, without waiting.
pub fn drain_available<I: EngineIo + ?Sized>(
    io: &mut I,
    timing: &TimingConfig,
) -> Result<Accumulator, TetherError> {
    let mut buf = vec![0; timing.read_chunk.max(1)];
    let mut acc = Accumulator::default();
    loop {
        let results = io.read_results(&mut buf)?;
        acc.results.extend_from_slice(&buf[..results]);
        let log = io.read_log(&mut buf)?;
        acc.log.extend_from_slice(&buf[..log]);
        if results == 0 && log == 0 {
            return Ok(acc);
        }
    }
}

const MARKUP_START: &[u8] = b"<!DOCTYPE html>";
const MARKUP_END: &[u8] = b"</html>";

/// Read a complete markup listing from the results stream.
///
/// Gives up after `wait` if no document has started. Once the start tag
/// has been seen, waits for the end tag as long as the engine lives.
pub fn drain_listing<I: EngineIo + ?Sized>(
    io: &mut I,
    timing: &TimingConfig,
    wait: Duration,
) -> Result<String, TetherError> {
    let mut buf = vec![0; timing.read_chunk.max(1)];
    let mut listing = Vec::new();
    let mut started = false;
    let mut retries = timing.retries_within(wait);
    loop {
        if !io.is_alive() {
            return Err(terminated(io));
        }
        let n = io.read_results(&mut buf)?;
        if n > 0 {
            listing.extend_from_slice(&buf[..n]);
            if !started {
                let head = &listing[..listing.len().min(20)];
                started = find_bytes(head, MARKUP_START).is_some();
            }
            if started {
                let tail = &listing[listing.len().saturating_sub(15)..];
                if find_bytes(tail, MARKUP_END).is_some() {
                    break;
                }
            }
            continue;
        }
        if started {
            thread::sleep(timing.idle_delay());
            continue;
        }
        retries -= 1;
        if retries == 0 {
            debug!("no listing started");
            break;
        }
        thread::sleep(timing.log_poll());
    }
    Ok(normalize_results(&String::from_utf8_lossy(&listing)))
}

/// Read the plain listing up to `marker`.
///
/// The caller has already queued a step that prints the marker. Stops when
/// the marker arrives, or after `wait` of consecutive silence.
pub fn drain_listing_text<I: EngineIo + ?Sized>(
    io: &mut I,
    timing: &TimingConfig,
    marker: &str,
    wait: Duration,
) -> Result<String, TetherError> {
    let mut buf = vec![0; timing.read_chunk.max(1)];
    let mut listing = Vec::new();
    let mut retries = timing.retries_within(wait);
    loop {
        if !io.is_alive() {
            return Err(terminated(io));
        }
        let n = io.read_results(&mut buf)?;
        if n > 0 {
            listing.extend_from_slice(&buf[..n]);
            retries = timing.retries_within(wait);
            if find_bytes(&listing, marker.as_bytes()).is_some() {
                break;
            }
            continue;
        }
        retries -= 1;
        if retries == 0 {
            debug!(marker, "listing marker never arrived");
            break;
        }
        thread::sleep(timing.log_poll());
    }
    let text = String::from_utf8_lossy(&listing);
    let text = match text.find(marker) {
        Some(i) => &text[..i],
        None => &text[..],
    };
    // only whole pages before the marker's page count
    let text = match text.rfind('\x0c') {
        Some(i) => &text[..i],
        None => "",
    };
    Ok(text.replace('\x0c', "\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{frame, ResultsMode};
    use crate::process::ExitState;
    use crate::streams::scripted::ScriptedIo;

    fn timing() -> TimingConfig {
        TimingConfig::immediate()
    }

    fn run(det: &mut CompletionDetector, io: &mut ScriptedIo) -> Result<(), TetherError> {
        loop {
            if det.poll(io)? == Poll::Complete {
                return Ok(());
            }
        }
    }

    #[test]
    fn find_bytes_locates_needle() {
        assert_eq!(find_bytes(b"hello world", b"world"), Some(6));
        assert_eq!(find_bytes(b"hello", b"xyz"), None);
        assert_eq!(find_bytes(b"ab", b"abc"), None);
    }

    #[test]
    fn completes_after_beacon_and_countdown() {
        let mut io = ScriptedIo::echoing();
        let token = Token::new(2);
        io.write_input(&frame("data a; run;", ResultsMode::Text, token))
            .unwrap();
        let timing = timing();
        let mut det = CompletionDetector::new(token, &timing);
        run(&mut det, &mut io).unwrap();
        assert!(det.beacon_seen());
        let acc = det.finish();
        assert!(acc.log_text().contains("E3969440A681A2408885998500000002\n"));
        // countdown of empty cycles happened after the beacon
        assert!(io.liveness_checks > timing.bail_countdown as usize);
    }

    #[test]
    fn results_are_read_before_log() {
        let mut io = ScriptedIo::default();
        io.push_results("<p>one</p>");
        io.push_log("log line\n");
        let timing = timing();
        let mut det = CompletionDetector::new(Token::new(1), &timing);
        assert_eq!(det.poll(&mut io).unwrap(), Poll::Progress);
        // the log was not touched while results had bytes
        assert_eq!(io.log.len(), 1);
        assert_eq!(det.poll(&mut io).unwrap(), Poll::Progress);
        assert!(io.log.is_empty());
        assert_eq!(det.poll(&mut io).unwrap(), Poll::Idle);
    }

    #[test]
    fn results_after_beacon_are_still_collected() {
        let mut io = ScriptedIo::default();
        io.push_log("\nE3969440A681A2408885998500000001\n");
        let timing = TimingConfig {
            bail_countdown: 2,
            ..TimingConfig::immediate()
        };
        let mut det = CompletionDetector::new(Token::new(1), &timing);
        assert_eq!(det.poll(&mut io).unwrap(), Poll::Progress);
        assert_eq!(det.poll(&mut io).unwrap(), Poll::Idle);
        io.push_results("late");
        assert_eq!(det.poll(&mut io).unwrap(), Poll::Progress);
        assert_eq!(det.poll(&mut io).unwrap(), Poll::Idle);
        assert_eq!(det.poll(&mut io).unwrap(), Poll::Complete);
        assert_eq!(det.finish().results, b"late");
    }

    #[test]
    fn other_token_does_not_complete() {
        let mut io = ScriptedIo::default();
        io.push_log("\nE3969440A681A2408885998500000001\n");
        let timing = timing();
        let mut det = CompletionDetector::new(Token::new(2), &timing);
        for _ in 0..20 {
            assert_ne!(det.poll(&mut io).unwrap(), Poll::Complete);
        }
        assert!(!det.beacon_seen());
    }

    #[test]
    fn dead_engine_is_terminal() {
        let mut io = ScriptedIo {
            die_at_check: Some(3),
            ..ScriptedIo::default()
        };
        let timing = timing();
        let mut det = CompletionDetector::new(Token::new(1), &timing);
        let err = run(&mut det, &mut io).unwrap_err();
        assert!(matches!(err, TetherError::ProcessTerminated(_)));
        assert_eq!(io.exit, Some(ExitState::Exited(1)));
    }

    #[test]
    fn absorb_detects_beacon_in_folded_log() {
        let timing = timing();
        let mut det = CompletionDetector::new(Token::new(5), &timing);
        det.absorb(Accumulator {
            log: b"partial\nE3969440A681A2408885998500000005\n".to_vec(),
            results: b"rows".to_vec(),
        });
        assert!(det.beacon_seen());
        assert_eq!(det.finish().results, b"rows");
    }

    #[test]
    fn segment_sits_between_previous_echo_and_directive() {
        let raw = "9    %put E3969440A681A2408885998500000001;\n\
                   E3969440A681A2408885998500000001\n\
                   10   ;*';*\";*/;\n\
                   11   data a; x=1; run;\n\
                   NOTE: The data set WORK.A has 1 observations.\n\
                   12   ;*';*\";*/;\n\
                   13   %put E3969440A681A2408885998500000002;\n\
                   E3969440A681A2408885998500000002\n";
        let segment = extract_log_segment(raw, Token::new(2));
        assert!(segment.starts_with("10   \n"));
        assert!(segment.contains("NOTE: The data set WORK.A"));
        assert!(!segment.contains("E3969440A681A2408885998500000002"));
        assert!(!segment.contains("E3969440A681A2408885998500000001"));
        assert!(!segment.contains(GUARD));
        assert!(segment.ends_with("12   "));
    }

    #[test]
    fn segment_without_previous_echo_keeps_head() {
        let raw = "1    data b;\n2    %put E3969440A681A2408885998500000003;\nE3969440A681A2408885998500000003\n";
        assert_eq!(extract_log_segment(raw, Token::new(3)), "1    data b;");
    }

    #[test]
    fn empty_markup_tail_is_dropped() {
        let boilerplate = format!("<style>{}</style>{}\n</html>", "x".repeat(300), EMPTY_MARKUP_TAIL);
        assert_eq!(normalize_results(&boilerplate), "");

        let content = format!("{EMPTY_MARKUP_TAIL}{}", "<td>1</td>".repeat(20));
        assert_eq!(normalize_results(&content), content);
    }

    #[test]
    fn normalization_rewrites_markup() {
        let raw = "<body class=\"c body\">\x0c<p style=\"font-size: x-small;\">";
        assert_eq!(
            normalize_results(raw),
            "<body class=\"l body\">\n<p style=\"font-size:  normal;\">"
        );
    }

    #[test]
    fn log_drain_stops_at_first_gap_after_data() {
        let mut io = ScriptedIo::default();
        io.push_log("first ");
        io.push_log("second");
        let got = drain_log(&mut io, &timing(), Duration::from_secs(1)).unwrap();
        assert_eq!(got, "first second");
    }

    #[test]
    fn log_drain_gives_up_when_silent() {
        let mut io = ScriptedIo::default();
        let timing = TimingConfig {
            log_poll_ms: 0,
            ..TimingConfig::immediate()
        };
        let got = drain_log(&mut io, &timing, Duration::from_secs(1)).unwrap();
        assert_eq!(got, "");
        assert!(io.reads >= 1);
    }

    #[test]
    fn listing_waits_for_end_tag() {
        let mut io = ScriptedIo::default();
        io.push_results("<!DOCTYPE html>\n<html><body>");
        io.push_results("<table></table>");
        io.push_results("</body>\n</html>\n");
        io.push_results("not read");
        let got = drain_listing(&mut io, &timing(), Duration::from_secs(1)).unwrap();
        assert!(got.starts_with("<!DOCTYPE html>"));
        assert!(got.trim_end().ends_with("</html>"));
        assert_eq!(io.results.len(), 1);
    }

    #[test]
    fn listing_without_start_gives_up() {
        let mut io = ScriptedIo::default();
        let got = drain_listing(&mut io, &timing(), Duration::from_millis(1)).unwrap();
        assert_eq!(got, "");
    }

    #[test]
    fn text_listing_without_page_break_is_empty() {
        let mut io = ScriptedIo::default();
        io.push_results("stray line\nmark-here\n");
        let got =
            drain_listing_text(&mut io, &timing(), "mark-here", Duration::from_secs(1)).unwrap();
        assert_eq!(got, "");
    }

    #[test]
    fn available_drain_empties_both_streams_without_waiting() {
        let mut io = ScriptedIo::default();
        io.push_results("r1");
        io.push_results("r2");
        io.push_log("l1");
        let acc = drain_available(&mut io, &timing()).unwrap();
        assert_eq!(acc.results, b"r1r2");
        assert_eq!(acc.log, b"l1");
        assert!(io.results.is_empty() && io.log.is_empty());

        let acc = drain_available(&mut io, &timing()).unwrap();
        assert_eq!(acc, Accumulator::default());
    }

    #[test]
    fn text_listing_cuts_at_marker_page() {
        let mut io = ScriptedIo::default();
        io.push_results("\x0cpage one\n\x0cpage two\n");
        io.push_results("\x0cmark-here\n");
        let got =
            drain_listing_text(&mut io, &timing(), "mark-here", Duration::from_secs(1)).unwrap();
        assert_eq!(got, "\npage one\n\npage two\n");
    }
}
