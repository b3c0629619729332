//! Receiver interface for demultiplexed stream traffic.

/// Direction of a stream focus change seen on the input side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftDir {
    /// The stream took focus away from the default stream.
    Out,
    /// Focus returned to the default stream.
    In,
}

/// Handler for one demultiplexed input stream.
///
/// `on_data` receives payload bytes exactly as they appeared on the wire,
/// still escaped; pair it with an [`crate::escape::Unescaper`] to recover
/// the application bytes. Handlers must not block or try to pull more
/// input: a partial run is delivered as-is (with a `<NUL>` terminator) and
/// resumes transparently on the next read cycle.
pub trait StreamSink {
    /// Payload for this stream. `name` is the resolved stream name, `None`
    /// for the default stream; `terminator` is the control byte that ended
    /// the run, or `<NUL>` when it simply ran out of buffered bytes.
    fn on_data(&mut self, name: Option<&[u8]>, data: &[u8], terminator: u8);

    /// The stream gained or lost focus. Redundant shifts are suppressed
    /// before this is called.
    fn on_shift(&mut self, name: Option<&[u8]>, dir: ShiftDir) {
        let _ = (name, dir);
    }

    /// The stream was terminated by its peer and its entry released.
    fn on_end(&mut self, name: Option<&[u8]>) {
        let _ = name;
    }
}

/// Plain closures work as data-only sinks.
impl<F> StreamSink for F
where
    F: FnMut(Option<&[u8]>, &[u8], u8),
{
    fn on_data(&mut self, name: Option<&[u8]>, data: &[u8], terminator: u8) {
        self(name, data, terminator)
    }
}
