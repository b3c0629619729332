//! Stream handles: named output channels multiplexed over one descriptor.
//!
//! A handle owns an accumulation buffer of already-escaped bytes. The
//! buffer permanently begins with the stream's shift prefix
//! (`<SOH>` name `<SO>`, empty for the implicit default stream); every
//! flush sends the prefix, the payload and a trailing `<SO>` as one atomic
//! unit, so the channel structurally returns to the default stream between
//! units and units from different streams can never tear each other apart.

use std::sync::Arc;

use crate::channel::Channel;
use crate::codes;
use crate::error::{MulttyError, Result};
use crate::escape::{escape_into, EscapeStyle};
use crate::program::{ProgramId, ProgramSet};

/// One named (or default) output stream over a shared channel.
///
/// Exclusively owned by the caller; share across threads only with
/// external synchronization.
pub struct StreamHandle {
    channel: Arc<Channel>,
    /// Program this stream belongs to, if any. Only consulted by the
    /// `*_within` operations, which fold a program switch into the flush.
    owner: Option<ProgramId>,
    /// Escaped bytes awaiting flush; always starts with the shift prefix.
    buf: Vec<u8>,
    /// Length of the permanent shift prefix at the head of `buf`.
    shift: usize,
}

impl StreamHandle {
    /// Open a named stream. The name becomes part of every wire unit, so
    /// it must be free from anything `BINARY`-escapable.
    pub fn open(channel: Arc<Channel>, name: &str) -> Result<Self> {
        Self::open_as(channel, name, None)
    }

    /// Open a named stream that belongs to a program.
    pub fn open_in_program(channel: Arc<Channel>, name: &str, owner: ProgramId) -> Result<Self> {
        Self::open_as(channel, name, Some(owner))
    }

    fn open_as(channel: Arc<Channel>, name: &str, owner: Option<ProgramId>) -> Result<Self> {
        if name.is_empty() {
            return Err(MulttyError::InvalidArgument("empty stream name"));
        }
        if !EscapeStyle::BINARY.is_free(name.as_bytes()) {
            return Err(MulttyError::InvalidArgument(
                "stream name contains escapable bytes",
            ));
        }
        // The prefix, one escaped byte and the trailing <SO> must all fit
        // inside a single atomic unit.
        if name.len() + 5 > channel.limit() {
            return Err(MulttyError::InvalidArgument(
                "stream name too long for channel atomic limit",
            ));
        }
        let mut buf = Vec::with_capacity(name.len() + 2);
        buf.push(codes::SOH);
        buf.extend_from_slice(name.as_bytes());
        buf.push(codes::SO);
        let shift = buf.len();
        Ok(Self {
            channel,
            owner,
            buf,
            shift,
        })
    }

    /// The implicit default stream: no name, no shift prefix, no trailing
    /// shift byte. All other streams return here after every flush.
    pub fn default_stream(channel: Arc<Channel>) -> Self {
        Self {
            channel,
            owner: None,
            buf: Vec::new(),
            shift: 0,
        }
    }

    /// Whether this handle addresses the implicit default stream.
    pub fn is_default(&self) -> bool {
        self.shift == 0
    }

    pub fn owner(&self) -> Option<&ProgramId> {
        self.owner.as_ref()
    }

    /// Bytes the buffer may hold: one below the channel limit, reserving
    /// room for the trailing shift byte.
    fn capacity(&self) -> usize {
        self.channel.limit() - 1
    }

    /// Send ASCII text, escaped under [`EscapeStyle::ASCII`].
    pub fn puts(&mut self, text: &str) -> Result<()> {
        self.put_loop(text.as_bytes(), EscapeStyle::ASCII, None)
            .map(|_| ())
    }

    /// Send binary data, escaped under [`EscapeStyle::BINARY`].
    ///
    /// Returns how many input bytes were sent. When a flush fails midway
    /// the count of bytes already on the wire is returned instead of the
    /// error, and the chunk staged for the failed flush is unstaged, so
    /// resuming from that count cannot duplicate bytes; a failure before
    /// anything was sent surfaces as the error itself.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        self.put_loop(bytes, EscapeStyle::BINARY, None)
    }

    /// [`StreamHandle::puts`] for a stream owned by a program, switching
    /// the channel to that program within the same atomic unit if needed.
    pub fn puts_within(&mut self, text: &str, programs: &mut ProgramSet) -> Result<()> {
        self.put_loop(text.as_bytes(), EscapeStyle::ASCII, Some(programs))
            .map(|_| ())
    }

    /// [`StreamHandle::write`] for a stream owned by a program.
    pub fn write_within(&mut self, bytes: &[u8], programs: &mut ProgramSet) -> Result<usize> {
        self.put_loop(bytes, EscapeStyle::BINARY, Some(programs))
    }

    fn put_loop(
        &mut self,
        bytes: &[u8],
        style: EscapeStyle,
        mut programs: Option<&mut ProgramSet>,
    ) -> Result<usize> {
        let total = bytes.len();
        let mut consumed = 0;
        while consumed < total {
            // Room for a pending program switch comes out of this unit's
            // capacity, so the combined flush stays under the atomic limit.
            let reserve = self.pending_switch_len(programs.as_deref());
            let cap = self.capacity().saturating_sub(reserve);
            let staged = self.buf.len();
            let n = escape_into(style, &mut self.buf, cap, &bytes[consumed..]);
            if let Err(e) = self.flush_with(programs.as_deref_mut()) {
                // Unstage the failed flush's chunk; a retry must not
                // duplicate bytes.
                self.buf.truncate(staged);
                if consumed == 0 {
                    return Err(e);
                }
                return Ok(consumed);
            }
            consumed += n;
        }
        Ok(total)
    }

    /// Wire bytes a flush would have to prepend to switch the channel to
    /// this stream's owning program.
    fn pending_switch_len(&self, programs: Option<&ProgramSet>) -> usize {
        match (&self.owner, programs) {
            (Some(owner), Some(programs)) if !programs.is_current(owner) => programs
                .plan_switch(owner)
                .map(|plan| plan.wire().len())
                .unwrap_or(0),
            _ => 0,
        }
    }

    /// Flush buffered bytes as one atomic wire unit.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_with(None)
    }

    /// Flush, first switching the channel to this stream's owning program
    /// when it is not the registry's current one. The switch sequence and
    /// the payload travel in the same atomic unit.
    pub fn flush_within(&mut self, programs: &mut ProgramSet) -> Result<()> {
        self.flush_with(Some(programs))
    }

    fn flush_with(&mut self, programs: Option<&mut ProgramSet>) -> Result<()> {
        let plan = match (&self.owner, programs) {
            (Some(owner), Some(programs)) if !programs.is_current(owner) => {
                Some((programs.plan_switch(owner)?, programs))
            }
            _ => None,
        };
        let switch_bytes: &[u8] = plan.as_ref().map_or(&[], |(p, _)| p.wire());
        let trailer: &[u8] = if self.shift > 0 { &[codes::SO] } else { &[] };
        self.channel
            .send_segments(&[switch_bytes, &self.buf, trailer])?;
        if let Some((plan, programs)) = plan {
            if let Some(owner) = &self.owner {
                programs.commit_switch(owner, &plan);
            }
        }
        // Keep the permanent prefix; only the payload is consumed.
        self.buf.truncate(self.shift);
        Ok(())
    }

    /// Flush any residual bytes and release the handle.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    /// [`StreamHandle::close`] for a stream owned by a program.
    pub fn close_within(mut self, programs: &mut ProgramSet) -> Result<()> {
        self.flush_within(programs)
    }
}
