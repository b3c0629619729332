//! Input demultiplexing: turning one incoming byte channel back into
//! streams and programs.
//!
//! - [`parser`]: the pure unit recognizer (private)
//! - [`flow`]: the [`InputFlow`] driving reads and dispatch
//! - [`sink`]: the [`StreamSink`] receiver interface

mod flow;
mod parser;
mod sink;

pub use flow::InputFlow;
pub use sink::{ShiftDir, StreamSink};
