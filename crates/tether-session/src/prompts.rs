//! Interactive prompts the engine raises after an interrupt.
//!
//! The engine asks one of two kinds of multiple-choice question on the
//! results stream, each ending with a line holding a lone `?`. Anything else
//! that ends in a question is reported as an unknown prompt.

use std::fmt;

use tether_types::TetherError;

/// Line that ends every prompt.
const TERMINATOR: &str = "\n?";

/// The known prompt kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// A numbered menu introduced by `Select:`.
    Select,
    /// A key prompt introduced by `Press`.
    Press,
}

struct Signature {
    kind: PromptKind,
    delimiter: &'static str,
    /// Answer that lets the interrupted step carry on.
    benign_answer: &'static str,
    /// Text that must be present for `benign_answer` to mean "continue".
    benign_evidence: &'static str,
}

const SIGNATURES: &[Signature] = &[
    Signature {
        kind: PromptKind::Select,
        delimiter: "Select:",
        benign_answer: "C",
        benign_evidence: "C. Cancel",
    },
    Signature {
        kind: PromptKind::Press,
        delimiter: "Press",
        benign_answer: "N",
        benign_evidence: "N to continue",
    },
];

/// Menu labels the policy picks from, most preferred first.
const SELECT_PREFERENCE: &[&str] = &[
    "Cancel Submitted Statements",
    "Halt DATA",
    "Cancel the dialog",
];

impl PromptKind {
    fn signature(self) -> &'static Signature {
        match self {
            PromptKind::Select => &SIGNATURES[0],
            PromptKind::Press => &SIGNATURES[1],
        }
    }
}

impl fmt::Display for PromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptKind::Select => f.write_str("select"),
            PromptKind::Press => f.write_str("press"),
        }
    }
}

/// A prompt lifted out of the results stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub kind: PromptKind,
    /// From the delimiter through the terminating `?` line.
    pub question: String,
}

/// What scanning pending results text found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scan {
    /// No prompt; the text is ordinary output.
    Nothing,
    /// A delimiter is present but the question has not finished arriving.
    Incomplete,
    Prompt(Prompt),
    /// A question with no known delimiter.
    Unknown(String),
}

/// Last place `delimiter` opens a line (after optional indentation) as a
/// whole word.
fn delimiter_at(pending: &str, delimiter: &str) -> Option<usize> {
    pending.rmatch_indices(delimiter).map(|(i, _)| i).find(|&i| {
        let line_start = pending[..i].rfind('\n').map_or(0, |nl| nl + 1);
        let indented = pending[line_start..i].chars().all(|c| c == ' ' || c == '\t');
        let word_end = pending[i + delimiter.len()..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        indented && word_end
    })
}

/// Look for a prompt in text read from the results stream.
pub fn scan(pending: &str) -> Scan {
    for sig in SIGNATURES {
        let Some(start) = delimiter_at(pending, sig.delimiter) else {
            continue;
        };
        let rest = &pending[start..];
        return match rest.find(TERMINATOR) {
            Some(end) => Scan::Prompt(Prompt {
                kind: sig.kind,
                question: rest[..end + TERMINATOR.len()].to_string(),
            }),
            None => Scan::Incomplete,
        };
    }
    if pending.trim_end().ends_with(TERMINATOR) {
        Scan::Unknown(pending.trim().to_string())
    } else {
        Scan::Nothing
    }
}

/// How an answer leaves the interrupted step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// The step resumes.
    Continue,
    /// The step, or the submission, is cancelled.
    Abort,
}

/// Classify `answer` to `prompt`.
pub fn classify(prompt: &Prompt, answer: &str) -> ResponseKind {
    let sig = prompt.kind.signature();
    if answer.trim().eq_ignore_ascii_case(sig.benign_answer)
        && prompt.question.contains(sig.benign_evidence)
    {
        ResponseKind::Continue
    } else {
        ResponseKind::Abort
    }
}

/// The answer chosen without asking anyone.
pub fn policy_response(prompt: &Prompt) -> Result<String, TetherError> {
    let q = &prompt.question;
    match prompt.kind {
        PromptKind::Select => {
            for label in SELECT_PREFERENCE {
                let Some(at) = q.find(label) else { continue };
                let numbered = q[..at].rsplit_once('.').map_or("", |(head, _)| head);
                let option = numbered.rsplit(char::is_whitespace).next().unwrap_or("");
                if !option.is_empty() {
                    return Ok(option.to_string());
                }
            }
            Err(TetherError::UnknownPrompt(format!(
                "no cancel option in menu: {q}"
            )))
        }
        PromptKind::Press => {
            if let Some(at) = q.find(" to exit ") {
                if let Some(key) = q[..at].split_whitespace().last() {
                    return Ok(key.to_string());
                }
            }
            if q.contains("N to continue") {
                Ok("Y".into())
            } else {
                Ok("X".into())
            }
        }
    }
}

/// Answers prompts on behalf of a user.
///
/// Returning `None` declines; the policy answer is used instead.
pub trait PromptResponder: Send {
    fn respond(&mut self, question: &str) -> Option<String>;
}

impl<F> PromptResponder for F
where
    F: FnMut(&str) -> Option<String> + Send,
{
    fn respond(&mut self, question: &str) -> Option<String> {
        self(question)
    }
}

/// Binary choice offered over a remote shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteChoice {
    Terminate,
    Continue,
}

pub const REMOTE_QUESTION: &str = "Attention handling is not supported over a remote shell. \
Enter T to terminate the submission or C to continue.";

pub const REMOTE_REPROMPT: &str = "Please enter T to terminate or C to continue.";

/// Where prompt answers come from.
#[derive(Default)]
pub enum ResponseStrategy {
    Interactive(Box<dyn PromptResponder>),
    #[default]
    Policy,
}

impl ResponseStrategy {
    pub fn interactive<R: PromptResponder + 'static>(responder: R) -> Self {
        ResponseStrategy::Interactive(Box::new(responder))
    }

    /// Answer a recognized prompt.
    pub fn answer(&mut self, prompt: &Prompt) -> Result<String, TetherError> {
        if let ResponseStrategy::Interactive(responder) = self {
            if let Some(answer) = responder.respond(&prompt.question) {
                let answer = answer.trim();
                if !answer.is_empty() {
                    return Ok(answer.to_string());
                }
            }
        }
        policy_response(prompt)
    }

    /// Ask for terminate-or-continue, re-asking on anything else.
    pub fn remote_choice(&mut self) -> Result<RemoteChoice, TetherError> {
        let ResponseStrategy::Interactive(responder) = self else {
            return Ok(RemoteChoice::Terminate);
        };
        let mut question = REMOTE_QUESTION;
        loop {
            let Some(answer) = responder.respond(question) else {
                return Err(TetherError::AttentionUnsupported(
                    "no terminate/continue answer over a remote shell".into(),
                ));
            };
            match answer.trim().to_ascii_uppercase().as_str() {
                "T" => return Ok(RemoteChoice::Terminate),
                "C" => return Ok(RemoteChoice::Continue),
                _ => question = REMOTE_REPROMPT,
            }
        }
    }
}

impl fmt::Debug for ResponseStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseStrategy::Interactive(_) => f.write_str("Interactive(..)"),
            ResponseStrategy::Policy => f.write_str("Policy"),
        }
    }
}
