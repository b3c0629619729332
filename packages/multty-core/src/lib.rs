//! Core mulTTY protocol engine.
//!
//! mulTTY multiplexes named streams and addressable programs over one
//! ordinary byte channel (a pipe, pty or serial line) while staying
//! compatible with plain ASCII tooling: unframed bytes simply belong to
//! the implicit default stream. The crate provides:
//!
//! - [`escape`]: per-style control-code escaping (`<DLE>` + XOR 0x40)
//! - [`channel`]: the shared descriptor with its atomic-write discipline
//! - [`stream`]: buffered, named output handles
//! - [`program`]: program identities, the registry and MRU switching
//! - [`demux`]: the input-side state machine dispatching to sinks
//!
//! No logging subscriber is installed; diagnostics go through `tracing`
//! and are the embedding application's to surface.

pub mod channel;
pub mod demux;
pub mod error;
pub mod escape;
pub mod program;
pub mod stream;

pub use channel::Channel;
pub use demux::{InputFlow, ShiftDir, StreamSink};
pub use error::{MulttyError, Result};
pub use escape::{EscapeStyle, Unescaper};
pub use program::{Program, ProgramId, ProgramSet};
pub use stream::StreamHandle;

use std::fs::File;
use std::os::fd::AsFd;
use std::sync::Arc;

/// Conventional name of the secondary stream for diagnostic output.
pub const DIAGNOSTIC_STREAM: &str = "stderr";

/// The three conventional endpoints bound to the process's standard
/// descriptors: the default output stream, a named diagnostic stream, and
/// the input flow. The two output handles share one channel (and thus one
/// atomic-write discipline) over a duplicated stdout.
///
/// Construct once and pass around by reference; nothing here is a hidden
/// global.
pub fn standard_streams() -> Result<(StreamHandle, StreamHandle, InputFlow<File>)> {
    let channel = Arc::new(Channel::stdout()?);
    let output = StreamHandle::default_stream(Arc::clone(&channel));
    let diagnostics = StreamHandle::open(channel, DIAGNOSTIC_STREAM)?;
    let stdin = std::io::stdin().as_fd().try_clone_to_owned()?;
    let input = InputFlow::new(File::from(stdin));
    Ok((output, diagnostics, input))
}

/// The wire-level control-code vocabulary. All values are single bytes.
pub mod codes {
    /// Padding / "ended at buffer end" marker; never structural on its own.
    pub const NUL: u8 = 0x00;
    /// Start of Heading: begins an optional name before a control byte.
    pub const SOH: u8 = 0x01;
    /// Shift Out: move focus onto the addressed stream.
    pub const SO: u8 = 0x0e;
    /// Shift In: move focus back off the addressed stream.
    pub const SI: u8 = 0x0f;
    /// Data Link Escape: prefixes an escaped byte (original XOR 0x40).
    pub const DLE: u8 = 0x10;
    /// `<DC1>`: push program context up to the parent.
    pub const PUP: u8 = 0x11;
    /// `<DC2>`: remove the addressed or current program.
    pub const PRM: u8 = 0x12;
    /// `<DC3>`: push program context down to a child.
    pub const PDN: u8 = 0x13;
    /// `<DC4>`: switch program focus, or swap back when bare.
    pub const PSW: u8 = 0x14;
    /// End of Medium: terminates a named or current stream, or the
    /// program context when no stream is current.
    pub const EM: u8 = 0x19;
    /// Unit Separator: splits an identity from its description.
    pub const US: u8 = 0x1f;
    /// Escaped as if it were `<BS>`; its slot in the style bitmask.
    pub const DEL: u8 = 0x7f;
    /// Telnet IAC, escaped as if it were `<NUL>`.
    pub const IAC: u8 = 0xff;
}
