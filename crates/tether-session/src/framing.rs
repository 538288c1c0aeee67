//! Sentinel framing of submissions.
//!
//! Every framed submission is written as
//!
//! ```text
//! [renderer open]            (markup mode only)
//! <guard>\n<code>\n<guard>
//! [renderer close]           (markup mode only)
//! \n%put <beacon prefix><token>;\n
//! ```
//!
//! The guard is a run of comment terminators that closes any quote or
//! comment state the caller's code may have left open. The `%put` directive
//! makes the engine echo the beacon to its log once everything before it
//! has run, which is the only completion signal the engine gives.

use std::fmt;
use std::str::FromStr;

use tether_types::TetherError;

/// Inert comment sequence written before and after the caller's code.
pub const GUARD: &str = ";*';*\";*/;";

/// Fixed prefix of every beacon; the token's eight digits follow it.
pub const BEACON_PREFIX: &str = "E3969440A681A24088859985";

/// Switch the results stream to the markup renderer with inline graphics.
pub const RENDERER_OPEN: &str = "ods listing close;ods html5 file=stdout options(bitmap_mode='inline') device=png; ods graphics on / outputfmt=png;\n";

/// Close the markup renderer and restore the plain listing.
pub const RENDERER_CLOSE: &str = "ods html5 close;ods listing;\n";

/// Unit run right after launch so boot banners never reach a caller.
pub const HOUSEKEEPING_UNIT: &str =
    "options svgtitle='svgtitle'; options validvarname=any; ods graphics on;";

/// Unit that asks the engine to exit.
pub const SHUTDOWN_UNIT: &str = ";*';*\";*/;\n;quit;endsas;";

/// Literal row printed to the listing to mark the end of plain-text capture.
pub const LISTING_MARKER: &str = "Tether listing marker";

/// Step that prints [`LISTING_MARKER`] to the listing.
pub fn listing_marker_step() -> String {
    format!("data _null_;file print;put '{LISTING_MARKER}';run;")
}

/// How results come back on the results stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultsMode {
    /// Structured markup from the engine's renderer.
    #[default]
    Html,
    /// The engine's plain listing.
    Text,
}

impl ResultsMode {
    pub fn is_markup(self) -> bool {
        self == ResultsMode::Html
    }
}

impl FromStr for ResultsMode {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "html" => Ok(ResultsMode::Html),
            "text" => Ok(ResultsMode::Text),
            other => Err(TetherError::ConfigError(format!(
                "unknown results mode {other:?} (expected html or text)"
            ))),
        }
    }
}

impl fmt::Display for ResultsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultsMode::Html => f.write_str("html"),
            ResultsMode::Text => f.write_str("text"),
        }
    }
}

/// Per-submission correlation token: the session's submission counter.
///
/// Rendered as eight zero-padded digits after [`BEACON_PREFIX`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Token(u64);

impl Token {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The token of the submission before this one. Its echo marks where
    /// this submission's log begins.
    pub fn previous(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// The directive written after the code: `%put <beacon>;`.
    pub fn directive(self) -> String {
        format!("%put {BEACON_PREFIX}{self};")
    }

    /// What the engine prints when it runs the directive: the beacon at
    /// the start of a log line.
    pub fn echo(self) -> String {
        format!("\n{BEACON_PREFIX}{self}")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08}", self.0)
    }
}

/// Frame a unit of code for submission under `token`.
pub fn frame(code: &str, mode: ResultsMode, token: Token) -> Vec<u8> {
    let mut out = String::with_capacity(code.len() + 256);
    if mode.is_markup() {
        out.push_str(RENDERER_OPEN);
    }
    out.push_str(GUARD);
    out.push('\n');
    out.push_str(code);
    out.push('\n');
    out.push_str(GUARD);
    if mode.is_markup() {
        out.push_str(RENDERER_CLOSE);
    }
    out.push('\n');
    out.push_str(&token.directive());
    out.push('\n');
    out.into_bytes()
}

/// Fire-and-forget framing: renderer wrap only, no guard and no beacon.
pub fn frame_unguarded(code: &str, mode: ResultsMode) -> Vec<u8> {
    let mut out = String::with_capacity(code.len() + 160);
    if mode.is_markup() {
        out.push_str(RENDERER_OPEN);
    }
    out.push_str(code);
    out.push('\n');
    if mode.is_markup() {
        out.push_str(RENDERER_CLOSE);
    }
    out.into_bytes()
}

/// Re-arm the beacon after an interrupt discarded the queued statements.
pub fn resync(token: Token) -> Vec<u8> {
    format!("{RENDERER_CLOSE}{}\n", token.directive()).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_zero_padded() {
        assert_eq!(Token::new(7).to_string(), "00000007");
        assert_eq!(Token::new(12345678).to_string(), "12345678");
        assert_eq!(
            Token::new(3).directive(),
            "%put E3969440A681A2408885998500000003;"
        );
        assert_eq!(Token::new(3).echo(), "\nE3969440A681A2408885998500000003");
    }

    #[test]
    fn previous_saturates_at_zero() {
        assert_eq!(Token::new(5).previous(), Token::new(4));
        assert_eq!(Token::new(0).previous(), Token::new(0));
        assert_eq!(Token::new(4).next(), Token::new(5));
    }

    #[test]
    fn text_frame_has_guards_and_beacon() {
        let framed = String::from_utf8(frame("data a; x=1; run;", ResultsMode::Text, Token::new(2)))
            .unwrap();
        assert_eq!(
            framed,
            ";*';*\";*/;\ndata a; x=1; run;\n;*';*\";*/;\n%put E3969440A681A2408885998500000002;\n"
        );
        assert!(!framed.contains("ods html5"));
    }

    #[test]
    fn markup_frame_wraps_code_in_renderer() {
        let framed =
            String::from_utf8(frame("proc print; run;", ResultsMode::Html, Token::new(9))).unwrap();
        assert!(framed.starts_with(RENDERER_OPEN));
        let close = framed.find(RENDERER_CLOSE).unwrap();
        let code = framed.find("proc print").unwrap();
        let beacon = framed.find(&Token::new(9).directive()).unwrap();
        assert!(code < close && close < beacon);
    }

    #[test]
    fn empty_code_still_carries_beacon() {
        let framed = String::from_utf8(frame("", ResultsMode::Text, Token::new(1))).unwrap();
        assert!(framed.contains(&Token::new(1).directive()));
    }

    #[test]
    fn unguarded_frame() {
        assert_eq!(frame_unguarded(";run;", ResultsMode::Text), b";run;\n");
        let html = String::from_utf8(frame_unguarded("x", ResultsMode::Html)).unwrap();
        assert!(html.starts_with(RENDERER_OPEN) && html.ends_with(RENDERER_CLOSE));
        assert!(!html.contains(BEACON_PREFIX));
    }

    #[test]
    fn resync_closes_renderer_then_beacon() {
        let text = String::from_utf8(resync(Token::new(4))).unwrap();
        assert_eq!(
            text,
            "ods html5 close;ods listing;\n%put E3969440A681A2408885998500000004;\n"
        );
    }

    #[test]
    fn results_mode_parsing() {
        assert_eq!("HTML".parse::<ResultsMode>().unwrap(), ResultsMode::Html);
        assert_eq!("text".parse::<ResultsMode>().unwrap(), ResultsMode::Text);
        assert!("pdf".parse::<ResultsMode>().is_err());
        assert_eq!(ResultsMode::Text.to_string(), "text");
    }

    #[test]
    fn marker_step_names_marker() {
        assert!(listing_marker_step().contains(LISTING_MARKER));
    }
}
