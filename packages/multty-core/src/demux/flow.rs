//! The input flow: reading, buffering and dispatching one mulTTY channel.
//!
//! [`InputFlow`] owns the read side of a channel and runs the recognizer
//! from [`super::parser`] over whatever has been buffered, applying each
//! unit in turn:
//!
//! - shifts move focus between the default stream and named streams,
//! - stream ends release registry entries,
//! - program verbs are applied to an owned [`ProgramSet`],
//! - application runs go to the [`StreamSink`] registered for the stream
//!   that currently has focus.
//!
//! Malformed bytes are logged and dropped; the flow never wedges on
//! adversarial input.

use std::collections::HashMap;
use std::io::Read;

use tracing::{debug, warn};

use crate::codes;
use crate::error::{MulttyError, Result};
use crate::escape::EscapeStyle;
use crate::program::{ProgramId, ProgramSet};

use super::parser::{self, NameSpan, ProgramOp, Step, Unit};
use super::sink::{ShiftDir, StreamSink};

/// Bytes pulled from the source per read cycle.
const READ_CHUNK: usize = 1024;

/// Registry entry for one named input stream.
struct InStream {
    /// Remembered shift polarity; true while the stream holds focus.
    shifted: bool,
    sink: Option<Box<dyn StreamSink>>,
}

impl InStream {
    fn new() -> Self {
        Self {
            shifted: false,
            sink: None,
        }
    }
}

/// Demultiplexer over one readable byte source.
///
/// Owned by a single thread; the parser runs indefinitely over a live
/// stream and has no terminal state.
pub struct InputFlow<R> {
    source: R,
    buf: Vec<u8>,
    /// Upper bound on bytes held back for an incomplete name before the
    /// flow gives up on the `<SOH>` and resynchronizes.
    limit: usize,
    streams: HashMap<Vec<u8>, InStream>,
    default_sink: Option<Box<dyn StreamSink>>,
    /// Stream currently holding focus; `None` is the default stream.
    current: Option<Vec<u8>>,
    programs: ProgramSet,
}

impl<R: Read> InputFlow<R> {
    /// Wrap a byte source with the platform pipe-buffer pending limit.
    pub fn new(source: R) -> Self {
        Self::with_limit(source, libc::PIPE_BUF)
    }

    pub fn with_limit(source: R, limit: usize) -> Self {
        Self {
            source,
            buf: Vec::new(),
            limit,
            streams: HashMap::new(),
            default_sink: None,
            current: None,
            programs: ProgramSet::new(),
        }
    }

    /// Register the handler for a named stream, or for the default stream
    /// when `name` is `None`. Replaces any earlier handler.
    pub fn register(&mut self, name: Option<&str>, sink: Box<dyn StreamSink>) -> Result<()> {
        match name {
            None => self.default_sink = Some(sink),
            Some(n) => {
                if n.is_empty() || !EscapeStyle::BINARY.is_free(n.as_bytes()) {
                    return Err(MulttyError::InvalidArgument("invalid stream name"));
                }
                self.streams
                    .entry(n.as_bytes().to_vec())
                    .or_insert_with(InStream::new)
                    .sink = Some(sink);
            }
        }
        Ok(())
    }

    /// The program registry as updated by observed program verbs.
    pub fn programs(&self) -> &ProgramSet {
        &self.programs
    }

    /// One read cycle: pull available bytes, then dispatch every complete
    /// unit. A source reporting "would block" counts as zero new bytes,
    /// not as an error. Returns the number of bytes read.
    pub fn poll(&mut self) -> Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = match self.source.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => 0,
            Err(e) => return Err(e.into()),
        };
        self.buf.extend_from_slice(&chunk[..n]);
        self.process();
        Ok(n)
    }

    /// Inject bytes directly, bypassing the source. Useful when the caller
    /// does its own reading.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        self.process();
    }

    /// Dispatch buffered units until only an incomplete tail remains.
    fn process(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        let mut pos = 0;
        loop {
            match parser::step(&buf[pos..]) {
                Step::NeedMore => {
                    // A name that never terminates must not buffer forever.
                    if buf.len() - pos > self.limit {
                        warn!(
                            pending = buf.len() - pos,
                            limit = self.limit,
                            "unterminated name exceeds pending limit, resynchronizing"
                        );
                        pos += 1;
                        continue;
                    }
                    break;
                }
                Step::Discard { len, bad } => {
                    warn!(byte = bad, len, "discarding malformed input");
                    pos += len;
                }
                Step::Unit { consumed, unit } => {
                    self.apply(unit);
                    pos += consumed;
                }
            }
        }
        self.buf = buf;
        self.buf.drain(..pos);
    }

    fn apply(&mut self, unit: Unit<'_>) {
        match unit {
            Unit::Shift { name, out } => self.apply_shift(name, out),
            Unit::End { name } => self.apply_end(name),
            Unit::Program { op, name } => self.apply_program(op, name),
            Unit::Run { data, terminator } => self.deliver(data, terminator),
        }
    }

    fn apply_shift(&mut self, name: Option<NameSpan<'_>>, out: bool) {
        match (name, out) {
            (Some(span), true) => {
                let n = span.identity;
                if self.current.as_deref() == Some(n) {
                    return;
                }
                // The stream losing focus implicitly returns to rest.
                if let Some(prev) = self.current.take() {
                    if let Some(e) = self.streams.get_mut(&prev) {
                        e.shifted = false;
                    }
                }
                let entry = self
                    .streams
                    .entry(n.to_vec())
                    .or_insert_with(InStream::new);
                entry.shifted = true;
                if let Some(sink) = entry.sink.as_mut() {
                    sink.on_shift(Some(n), ShiftDir::Out);
                }
                self.current = Some(n.to_vec());
            }
            (Some(span), false) => {
                let n = span.identity;
                let Some(entry) = self.streams.get_mut(n) else {
                    return;
                };
                if !entry.shifted {
                    return;
                }
                entry.shifted = false;
                if let Some(sink) = entry.sink.as_mut() {
                    sink.on_shift(Some(n), ShiftDir::In);
                }
                if self.current.as_deref() == Some(n) {
                    self.current = None;
                }
            }
            (None, _) => {
                // A bare shift returns focus to the default stream; when
                // already there it changes nothing and is suppressed.
                let Some(prev) = self.current.take() else {
                    return;
                };
                if let Some(e) = self.streams.get_mut(&prev) {
                    e.shifted = false;
                    if let Some(sink) = e.sink.as_mut() {
                        sink.on_shift(Some(&prev), ShiftDir::In);
                    }
                }
            }
        }
    }

    fn apply_end(&mut self, name: Option<NameSpan<'_>>) {
        let target = name
            .map(|span| span.identity.to_vec())
            .or_else(|| self.current.clone());
        let Some(n) = target else {
            // No stream context: the current program context ends.
            match self.programs.current().map(|p| *p.id()) {
                Some(pid) => {
                    debug!(program = ?pid, "program context ended");
                    self.programs.remove(&pid);
                }
                None => debug!("end marker with no stream or program context"),
            }
            return;
        };
        if self.current.as_deref() == Some(&n[..]) {
            self.current = None;
        }
        match self.streams.remove(&n) {
            Some(mut entry) => {
                if let Some(sink) = entry.sink.as_mut() {
                    sink.on_end(Some(&n));
                }
            }
            None => debug!(stream = ?String::from_utf8_lossy(&n), "end for unknown stream"),
        }
    }

    fn apply_program(&mut self, op: ProgramOp, name: Option<NameSpan<'_>>) {
        match op {
            ProgramOp::Switch => match name {
                Some(span) => {
                    let Some(pid) = self.identity_of(&span) else {
                        return;
                    };
                    let descr = span.description.and_then(|d| match std::str::from_utf8(d) {
                        Ok(s) => Some(s),
                        Err(_) => {
                            warn!("program description is not UTF-8, ignoring it");
                            None
                        }
                    });
                    if let Err(e) = self.programs.have(pid, descr) {
                        warn!(error = %e, "cannot register switched-to program");
                        return;
                    }
                    self.programs.note_switch(pid);
                }
                None => {
                    if self.programs.note_swap().is_none() {
                        warn!("program swap with no previous program");
                    }
                }
            },
            ProgramOp::Remove => {
                let pid = match name {
                    Some(span) => self.identity_of(&span),
                    None => self.programs.current().map(|p| *p.id()),
                };
                match pid {
                    Some(pid) => self.programs.remove(&pid),
                    None => warn!("program removal with nothing to remove"),
                }
            }
            // Nested program contexts are a separate extension; the verbs
            // are tolerated but carry no semantics here.
            ProgramOp::Up | ProgramOp::Down => {
                debug!(?op, "nested program context verb ignored")
            }
        }
    }

    fn identity_of(&self, span: &NameSpan<'_>) -> Option<ProgramId> {
        match ProgramId::from_parts(span.identity, span.description.is_some()) {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = %e, "invalid program identity on the wire");
                None
            }
        }
    }

    /// Hand an application run to the focused stream's sink.
    fn deliver(&mut self, data: &[u8], terminator: u8) {
        debug_assert_ne!(data.first(), Some(&codes::SOH));
        let (name, sink) = match &self.current {
            Some(n) => (
                Some(n.as_slice()),
                self.streams.get_mut(n).and_then(|e| e.sink.as_mut()),
            ),
            None => (None, self.default_sink.as_mut()),
        };
        match sink {
            Some(sink) => sink.on_data(name, data, terminator),
            None => debug!(
                stream = ?name.map(String::from_utf8_lossy),
                len = data.len(),
                "no sink registered, dropping run"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escape::Unescaper;
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;

    #[derive(Debug, PartialEq, Eq, Clone)]
    enum Ev {
        Data(Option<Vec<u8>>, Vec<u8>, u8),
        Shift(Vec<u8>, ShiftDir),
        End(Vec<u8>),
    }

    #[derive(Clone, Default)]
    struct Recorder {
        events: Rc<RefCell<Vec<Ev>>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<Ev> {
            self.events.borrow_mut().drain(..).collect()
        }
    }

    impl StreamSink for Recorder {
        fn on_data(&mut self, name: Option<&[u8]>, data: &[u8], terminator: u8) {
            self.events.borrow_mut().push(Ev::Data(
                name.map(<[u8]>::to_vec),
                data.to_vec(),
                terminator,
            ));
        }

        fn on_shift(&mut self, name: Option<&[u8]>, dir: ShiftDir) {
            self.events
                .borrow_mut()
                .push(Ev::Shift(name.unwrap_or_default().to_vec(), dir));
        }

        fn on_end(&mut self, name: Option<&[u8]>) {
            self.events
                .borrow_mut()
                .push(Ev::End(name.unwrap_or_default().to_vec()));
        }
    }

    fn flow() -> (InputFlow<Cursor<Vec<u8>>>, Recorder, Recorder) {
        let mut flow = InputFlow::with_limit(Cursor::new(Vec::new()), 64);
        let default = Recorder::default();
        let stderr = Recorder::default();
        flow.register(None, Box::new(default.clone())).expect("register");
        flow.register(Some("stderr"), Box::new(stderr.clone()))
            .expect("register");
        (flow, default, stderr)
    }

    #[test]
    fn test_demultiplexes_a_framed_unit() {
        let (mut flow, default, stderr) = flow();
        flow.feed(b"\x01stderr\x0efailed\n\x0emore");
        assert_eq!(
            stderr.take(),
            vec![
                Ev::Shift(b"stderr".to_vec(), ShiftDir::Out),
                Ev::Data(Some(b"stderr".to_vec()), b"failed\n".to_vec(), codes::SO),
                Ev::Shift(b"stderr".to_vec(), ShiftDir::In),
            ]
        );
        assert_eq!(
            default.take(),
            vec![Ev::Data(None, b"more".to_vec(), codes::NUL)]
        );
    }

    #[test]
    fn test_trailing_dle_defers_without_spurious_delivery() {
        let (mut flow, default, _) = flow();
        flow.feed(b"ab\x10");
        assert_eq!(
            default.take(),
            vec![Ev::Data(None, b"ab".to_vec(), codes::NUL)]
        );
        // The pair resolves against the next read and delivery resumes.
        flow.feed(b"\x41c");
        let events = default.take();
        assert_eq!(
            events,
            vec![Ev::Data(None, b"\x10\x41c".to_vec(), codes::NUL)]
        );

        // A sink unescapes across the chunk boundary without loss.
        let mut un = Unescaper::new();
        let mut plain = Vec::new();
        for ev in [&Ev::Data(None, b"ab".to_vec(), 0), &events[0]] {
            let Ev::Data(_, data, _) = ev else { unreachable!() };
            un.unescape_into(&mut plain, data);
        }
        assert_eq!(plain, b"ab\x01c");
    }

    #[test]
    fn test_resynchronizes_after_malformed_bytes() {
        let (mut flow, default, _) = flow();
        // Raw <STX>, then a bad escape pair, then legitimate data.
        flow.feed(b"\x02\x10zok");
        assert_eq!(
            default.take(),
            vec![Ev::Data(None, b"ok".to_vec(), codes::NUL)]
        );
    }

    #[test]
    fn test_redundant_shifts_are_suppressed() {
        let (mut flow, default, stderr) = flow();
        // Bare shift while already at the default stream: nothing.
        flow.feed(b"\x0e\x0f");
        assert_eq!(default.take(), vec![]);

        // Re-shifting the focused stream: only the first one is an event.
        flow.feed(b"\x01stderr\x0e\x01stderr\x0e");
        assert_eq!(
            stderr.take(),
            vec![Ev::Shift(b"stderr".to_vec(), ShiftDir::Out)]
        );
    }

    #[test]
    fn test_stream_end_releases_entry_and_focus() {
        let (mut flow, default, stderr) = flow();
        flow.feed(b"\x01stderr\x0edying\x19tail");
        assert_eq!(
            stderr.take(),
            vec![
                Ev::Shift(b"stderr".to_vec(), ShiftDir::Out),
                Ev::Data(Some(b"stderr".to_vec()), b"dying".to_vec(), codes::EM),
                Ev::End(b"stderr".to_vec()),
            ]
        );
        // Focus fell back to the default stream.
        assert_eq!(
            default.take(),
            vec![Ev::Data(None, b"tail".to_vec(), codes::NUL)]
        );
    }

    #[test]
    fn test_named_stream_end_without_focus() {
        let (mut flow, _, stderr) = flow();
        flow.feed(b"\x01stderr\x19");
        assert_eq!(stderr.take(), vec![Ev::End(b"stderr".to_vec())]);
    }

    #[test]
    fn test_program_switch_registers_and_focuses() {
        let (mut flow, _, _) = flow();
        flow.feed(b"\x01sh\x1fLogin Shell\x14");
        let current = flow.programs().current().expect("current program");
        assert_eq!(current.id().name(), b"sh");
        assert_eq!(current.description(), Some("Login Shell"));
    }

    #[test]
    fn test_bare_switch_swaps_programs() {
        let (mut flow, _, _) = flow();
        flow.feed(b"\x01sh\x14\x01pager\x14\x14");
        let current = flow.programs().current().expect("current program");
        assert_eq!(current.id().name(), b"sh");
        let previous = flow.programs().previous().expect("previous program");
        assert_eq!(previous.id().name(), b"pager");
    }

    #[test]
    fn test_program_removal() {
        let (mut flow, _, _) = flow();
        flow.feed(b"\x01sh\x14\x01pager\x14");
        assert_eq!(flow.programs().len(), 2);
        // Bare <DC2> removes the current program.
        flow.feed(b"\x12");
        assert_eq!(flow.programs().len(), 1);
        assert!(flow.programs().current().is_none());
        // Named removal takes out the rest.
        flow.feed(b"\x01sh\x12");
        assert!(flow.programs().is_empty());
    }

    #[test]
    fn test_end_without_stream_ends_current_program() {
        let (mut flow, _, _) = flow();
        flow.feed(b"\x01sh\x14\x19");
        assert!(flow.programs().is_empty());
    }

    #[test]
    fn test_runaway_name_resynchronizes() {
        let (mut flow, default, _) = flow();
        // 64-byte pending limit; a name that never terminates must not
        // stall the flow forever.
        let mut wire = vec![codes::SOH];
        wire.extend_from_slice(&[b'a'; 80]);
        flow.feed(&wire);
        let events = default.take();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Ev::Data(None, data, _) if data.iter().all(|&b| b == b'a')));
    }

    #[test]
    fn test_poll_reads_from_source() {
        let wire = b"\x01stderr\x0eoops\x0e".to_vec();
        let mut flow = InputFlow::with_limit(Cursor::new(wire), 64);
        let stderr = Recorder::default();
        flow.register(Some("stderr"), Box::new(stderr.clone()))
            .expect("register");
        let n = flow.poll().expect("poll");
        assert_eq!(n, 13);
        assert_eq!(
            stderr.take(),
            vec![
                Ev::Shift(b"stderr".to_vec(), ShiftDir::Out),
                Ev::Data(Some(b"stderr".to_vec()), b"oops".to_vec(), codes::SO),
                Ev::Shift(b"stderr".to_vec(), ShiftDir::In),
            ]
        );
        // A drained source keeps returning zero without erroring.
        assert_eq!(flow.poll().expect("poll"), 0);
    }

    #[test]
    fn test_register_validates_names() {
        let (mut flow, _, _) = flow();
        assert!(flow.register(Some(""), Box::new(Recorder::default())).is_err());
        assert!(flow
            .register(Some("bad\x01name"), Box::new(Recorder::default()))
            .is_err());
    }
}
