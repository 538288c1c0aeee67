//! The stream seam between the protocol logic and the engine process.
//!
//! The completion detector and the attention handler only ever talk to the
//! engine through [`EngineIo`]. [`EngineProcess`](crate::process::EngineProcess)
//! is the real implementation; tests drive the same logic with scripted
//! in-memory streams and zero delays.

use tether_types::TetherError;

use crate::process::ExitState;

/// Non-blocking access to a running engine's three standard streams.
pub trait EngineIo {
    /// Non-blocking read from the results (stdout) stream.
    /// Returns `Ok(0)` if nothing is available right now.
    fn read_results(&mut self, buf: &mut [u8]) -> Result<usize, TetherError>;

    /// Non-blocking read from the log (stderr) stream.
    /// Returns `Ok(0)` if nothing is available right now.
    fn read_log(&mut self, buf: &mut [u8]) -> Result<usize, TetherError>;

    /// Write all bytes to the engine's stdin and flush.
    fn write_input(&mut self, data: &[u8]) -> Result<(), TetherError>;

    /// Deliver an interrupt (SIGINT) to the engine.
    fn interrupt(&mut self) -> Result<(), TetherError>;

    /// Forcibly kill the engine (SIGKILL).
    fn kill(&mut self) -> Result<(), TetherError>;

    /// Zero-wait liveness check. Once this returns `false` it keeps returning
    /// `false`, and [`exit_state`](Self::exit_state) describes why.
    fn is_alive(&mut self) -> bool;

    /// How the engine went away, once it has.
    fn exit_state(&self) -> Option<ExitState>;

    /// The engine's process ID while it is running.
    fn pid(&self) -> Option<u32>;
}
