//! Request/response sessions over an interactive engine's standard streams.
//!
//! The engine is launched under a pseudo-terminal with its stdin, stdout and
//! stderr wired to pipes. Each submission is framed with guard comments and a
//! per-submission beacon that the engine echoes to its log; the completion
//! detector drains both output pipes until that beacon shows up.
//!
//! # Architecture
//!
//! - [`process::EngineProcess`]: launches the engine and tracks liveness
//! - [`streams::EngineIo`]: the stream seam the detector and attention handler drive
//! - [`framing`]: guard sequence, beacon tokens, renderer directives
//! - [`drain`]: the dual-stream completion detector and its narrower variants
//! - [`prompts`]: the closed table of interactive prompt signatures
//! - [`attention`]: the interrupt/attention state machine
//! - [`bulk`]: table import via load scripts and export over a transient socket
//! - [`session::Session`]: the caller-facing API tying it all together

pub mod attention;
pub mod bulk;
pub mod drain;
pub mod framing;
pub mod process;
pub mod prompts;
pub mod session;
pub mod streams;

pub use attention::{AttentionReport, CancelFlag, Disposition, Resolution};
pub use bulk::{ColumnKind, Table};
pub use framing::{ResultsMode, Token};
pub use process::{EngineProcess, ExitState};
pub use prompts::{PromptResponder, ResponseStrategy};
pub use session::{Session, SubmitOutput};
pub use streams::EngineIo;
