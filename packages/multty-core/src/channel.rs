//! The shared output channel and its atomic-write discipline.
//!
//! Everything mulTTY sends travels over one file descriptor shared by all
//! streams and programs. Framing only stays intact if every wire unit is
//! submitted as a single write that the OS will not interleave with writes
//! from other threads or processes holding the same descriptor. For pipes
//! POSIX guarantees this up to `PIPE_BUF` bytes, so that is the default
//! limit; callers targeting other channel kinds can substitute their own.

use std::io::IoSlice;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Mutex;

use crate::error::{MulttyError, Result};

/// One byte-oriented output channel with an atomic-write limit.
///
/// The channel does not buffer: callers compose a complete wire unit (as a
/// list of segments) and submit it with [`Channel::send_segments`]. A unit
/// larger than the limit is rejected rather than split, because splitting
/// would destroy the no-interleaving guarantee.
pub struct Channel {
    fd: OwnedFd,
    limit: usize,
    /// Optional defense-in-depth serialization of flushes across threads
    /// sharing this channel. Layered on top of the OS atomic-write
    /// guarantee, not a substitute for it.
    lock: Option<Mutex<()>>,
}

impl Channel {
    /// Wrap a descriptor with the platform pipe-buffer limit.
    pub fn new(fd: OwnedFd) -> Self {
        Self::with_limit(fd, libc::PIPE_BUF)
    }

    /// Wrap a descriptor with a caller-chosen atomic-write limit, for
    /// channels (sockets, files) whose bound differs from a pipe's.
    pub fn with_limit(fd: OwnedFd, limit: usize) -> Self {
        Self {
            fd,
            limit,
            lock: None,
        }
    }

    /// Duplicate the process's standard output into a channel.
    pub fn stdout() -> std::io::Result<Self> {
        let fd = std::io::stdout().as_fd().try_clone_to_owned()?;
        Ok(Self::new(fd))
    }

    /// Enable the process-wide flush mutex for this channel.
    pub fn with_flush_mutex(mut self) -> Self {
        self.lock = Some(Mutex::new(()));
        self
    }

    /// The largest wire unit this channel will submit in one write.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Submit `segments` as one atomic wire unit.
    ///
    /// Fails with [`MulttyError::AtomicLimit`] when the combined length
    /// exceeds the limit, without writing anything. A partial write at the
    /// OS level (permitted but unlikely under the limit) is compensated by
    /// retrying the remaining bytes in order; this loop is invisible to the
    /// caller and never re-orders bytes.
    pub fn send_segments(&self, segments: &[&[u8]]) -> Result<()> {
        let total: usize = segments.iter().map(|s| s.len()).sum();
        if total > self.limit {
            return Err(MulttyError::AtomicLimit {
                size: total,
                limit: self.limit,
            });
        }
        if total == 0 {
            return Ok(());
        }
        let _guard = self
            .lock
            .as_ref()
            .map(|m| m.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
        let mut written = 0;
        while written < total {
            let iov = gather_from(segments, written);
            let n = nix::sys::uio::writev(self.fd.as_fd(), &iov).map_err(std::io::Error::from)?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
            }
            written += n;
        }
        Ok(())
    }
}

/// Build the iovec list for everything past the first `skip` bytes.
fn gather_from<'a>(segments: &'a [&'a [u8]], skip: usize) -> Vec<IoSlice<'a>> {
    let mut iov = Vec::with_capacity(segments.len());
    let mut remaining = skip;
    for seg in segments {
        if remaining >= seg.len() {
            remaining -= seg.len();
            continue;
        }
        iov.push(IoSlice::new(&seg[remaining..]));
        remaining = 0;
    }
    iov
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;
    use std::fs::File;
    use std::io::Read;

    fn pipe_channel(limit: usize) -> (Channel, File) {
        let (rd, wr) = pipe().expect("pipe");
        (Channel::with_limit(wr, limit), File::from(rd))
    }

    fn read_all(rd: &mut File, want: usize) -> Vec<u8> {
        let mut out = vec![0u8; want];
        rd.read_exact(&mut out).expect("read");
        out
    }

    #[test]
    fn test_send_gathers_segments_in_order() {
        let (ch, mut rd) = pipe_channel(64);
        ch.send_segments(&[b"\x01stderr\x0e", b"failed\n", b"\x0e"])
            .expect("send");
        assert_eq!(read_all(&mut rd, 16), b"\x01stderr\x0efailed\n\x0e");
    }

    #[test]
    fn test_exact_limit_succeeds_and_one_over_fails() {
        let (ch, mut rd) = pipe_channel(8);
        ch.send_segments(&[b"12345678"]).expect("exactly at limit");
        assert_eq!(read_all(&mut rd, 8), b"12345678");

        let err = ch.send_segments(&[b"12345", b"6789"]).unwrap_err();
        match err {
            MulttyError::AtomicLimit { size, limit } => {
                assert_eq!(size, 9);
                assert_eq!(limit, 8);
            }
            other => panic!("Expected AtomicLimit, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_send_is_a_no_op() {
        let (ch, _rd) = pipe_channel(8);
        ch.send_segments(&[]).expect("empty");
        ch.send_segments(&[b"", b""]).expect("empty segments");
    }

    #[test]
    fn test_gather_from_skips_across_boundaries() {
        let segs: [&[u8]; 3] = [b"abc", b"de", b"fgh"];
        let iov = gather_from(&segs, 4);
        let flat: Vec<u8> = iov.iter().flat_map(|s| s.iter().copied()).collect();
        assert_eq!(flat, b"efgh");
    }

    #[test]
    fn test_flush_mutex_channel_still_sends() {
        let (rd, wr) = pipe().expect("pipe");
        let mut rd = File::from(rd);
        let ch = Channel::with_limit(wr, 64).with_flush_mutex();
        ch.send_segments(&[b"locked"]).expect("send");
        assert_eq!(read_all(&mut rd, 6), b"locked");
    }
}
