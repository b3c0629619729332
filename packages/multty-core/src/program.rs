//! Program multiplexing: identities, the program registry, and switching.
//!
//! A program is an independently addressable participant on the shared
//! channel, identified by a short name and, as part of the identity itself,
//! whether a human-readable description accompanies it. The registry keeps
//! a two-slot MRU history (`current`/`previous`) so that the common
//! back-and-forth switch (shell <-> pager) costs a single control byte on
//! the wire.

use std::collections::HashMap;
use std::fmt;

use crate::channel::Channel;
use crate::codes;
use crate::error::{MulttyError, Result};
use crate::escape::EscapeStyle;

/// Maximum length of a program name in bytes.
pub const MAX_NAME_LEN: usize = 32;

/// Fixed-width program identity: up to 32 name bytes, NUL padded, with a
/// `<US>` marker appended iff the program carries a description.
///
/// The marker is part of the identity: the same name with and without a
/// description is a *different* program.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId {
    bytes: [u8; MAX_NAME_LEN + 1],
}

impl ProgramId {
    /// Build an identity from a name, validating length and freedom from
    /// anything `BINARY`-escapable.
    pub fn new(name: &str, has_description: bool) -> Result<Self> {
        Self::from_parts(name.as_bytes(), has_description)
    }

    pub(crate) fn from_parts(name: &[u8], has_description: bool) -> Result<Self> {
        if name.len() > MAX_NAME_LEN {
            return Err(MulttyError::InvalidArgument("program name longer than 32 bytes"));
        }
        if !EscapeStyle::BINARY.is_free(name) {
            return Err(MulttyError::InvalidArgument(
                "program name contains escapable bytes",
            ));
        }
        let mut bytes = [0u8; MAX_NAME_LEN + 1];
        bytes[..name.len()].copy_from_slice(name);
        if has_description {
            bytes[name.len()] = codes::US;
        }
        Ok(Self { bytes })
    }

    /// The name portion, without padding or the `<US>` marker.
    pub fn name(&self) -> &[u8] {
        let end = self
            .bytes
            .iter()
            .position(|&b| b == 0 || b == codes::US)
            .unwrap_or(self.bytes.len());
        &self.bytes[..end]
    }

    /// Whether this identity announces a description.
    pub fn has_description(&self) -> bool {
        self.bytes.iter().any(|&b| b == codes::US)
    }

    /// The bytes that go on the wire: the name plus the `<US>` marker if
    /// present, without NUL padding.
    pub fn wire_bytes(&self) -> &[u8] {
        let len = self.name().len() + usize::from(self.has_description());
        &self.bytes[..len]
    }
}

impl fmt::Debug for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramId")
            .field("name", &String::from_utf8_lossy(self.name()))
            .field("has_description", &self.has_description())
            .finish()
    }
}

/// A registered program: its identity plus a mutable description.
#[derive(Debug, Clone)]
pub struct Program {
    id: ProgramId,
    description: Option<String>,
}

impl Program {
    pub fn id(&self) -> &ProgramId {
        &self.id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// How a switch to a given program will be encoded on the wire.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SwitchPlan {
    /// Already focused; nothing goes on the wire.
    AlreadyCurrent,
    /// Switching back to the previous program: a bare `<PSW>` byte.
    Swap,
    /// Full sequence: `<SOH>` identity description `<PSW>`.
    Full(Vec<u8>),
}

impl SwitchPlan {
    pub(crate) fn wire(&self) -> &[u8] {
        match self {
            SwitchPlan::AlreadyCurrent => &[],
            SwitchPlan::Swap => &[codes::PSW],
            SwitchPlan::Full(bytes) => bytes,
        }
    }
}

/// Registry of programs sharing one channel, with the 2-entry MRU history.
///
/// Not internally synchronized: callers sharing a set across threads must
/// provide their own locking.
#[derive(Debug, Default)]
pub struct ProgramSet {
    programs: HashMap<ProgramId, Program>,
    current: Option<ProgramId>,
    previous: Option<ProgramId>,
}

impl ProgramSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Have a program in the set, silently sharing an existing entry.
    ///
    /// A supplied description re-describes an existing entry; `None` leaves
    /// it untouched. Descriptions are only accepted on identities that were
    /// built with the description marker.
    pub fn have(&mut self, id: ProgramId, description: Option<&str>) -> Result<&Program> {
        if let Some(descr) = description {
            if !id.has_description() {
                return Err(MulttyError::InvalidArgument(
                    "description supplied for identity without description marker",
                ));
            }
            Self::check_description(descr)?;
        }
        let entry = self.programs.entry(id).or_insert_with(|| Program {
            id,
            description: None,
        });
        if let Some(descr) = description {
            entry.description = Some(descr.to_string());
        }
        Ok(entry)
    }

    /// Find a program by identity.
    pub fn find(&self, id: &ProgramId) -> Option<&Program> {
        self.programs.get(id)
    }

    /// Replace a program's description, re-validated against `MIXED`.
    pub fn describe(&mut self, id: &ProgramId, description: &str) -> Result<()> {
        Self::check_description(description)?;
        let prog = self
            .programs
            .get_mut(id)
            .ok_or(MulttyError::InvalidArgument("program not registered"))?;
        if !prog.id.has_description() {
            return Err(MulttyError::InvalidArgument(
                "identity was created without a description marker",
            ));
        }
        prog.description = Some(description.to_string());
        Ok(())
    }

    /// Remove a program, silently ignoring if it is absent. Clears the
    /// `current`/`previous` pointers if they referenced it.
    pub fn remove(&mut self, id: &ProgramId) {
        self.programs.remove(id);
        if self.current == Some(*id) {
            self.current = None;
        }
        if self.previous == Some(*id) {
            self.previous = None;
        }
    }

    pub fn current(&self) -> Option<&Program> {
        self.current.as_ref().and_then(|id| self.programs.get(id))
    }

    pub fn previous(&self) -> Option<&Program> {
        self.previous.as_ref().and_then(|id| self.programs.get(id))
    }

    pub fn is_current(&self, id: &ProgramId) -> bool {
        self.current == Some(*id)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// Switch focus to `id`, emitting the corresponding control sequence on
    /// the channel. The program must be registered.
    pub fn switch_to(&mut self, channel: &Channel, id: &ProgramId) -> Result<()> {
        let plan = self.plan_switch(id)?;
        if !matches!(plan, SwitchPlan::AlreadyCurrent) {
            channel.send_segments(&[plan.wire()])?;
        }
        self.commit_switch(id, &plan);
        Ok(())
    }

    /// Compute the wire encoding for a switch without mutating the MRU
    /// history. Used by stream flushing to fold the switch into the same
    /// atomic unit as the stream's payload.
    pub(crate) fn plan_switch(&self, id: &ProgramId) -> Result<SwitchPlan> {
        let prog = self
            .programs
            .get(id)
            .ok_or(MulttyError::InvalidArgument("program not registered"))?;
        if self.current == Some(*id) {
            return Ok(SwitchPlan::AlreadyCurrent);
        }
        if self.previous == Some(*id) {
            return Ok(SwitchPlan::Swap);
        }
        let descr = prog.description().unwrap_or("");
        let mut wire = Vec::with_capacity(2 + id.wire_bytes().len() + descr.len());
        wire.push(codes::SOH);
        wire.extend_from_slice(id.wire_bytes());
        wire.extend_from_slice(descr.as_bytes());
        wire.push(codes::PSW);
        Ok(SwitchPlan::Full(wire))
    }

    /// Apply the MRU bookkeeping for a switch whose bytes were sent.
    pub(crate) fn commit_switch(&mut self, id: &ProgramId, plan: &SwitchPlan) {
        match plan {
            SwitchPlan::AlreadyCurrent => {
                self.previous = None;
            }
            SwitchPlan::Swap => {
                self.previous = self.current;
                self.current = Some(*id);
            }
            SwitchPlan::Full(_) => {
                if self.current.is_some() {
                    self.previous = self.current;
                }
                self.current = Some(*id);
            }
        }
    }

    /// Focus bookkeeping for switches observed on the *input* side, where
    /// the bytes came from the peer instead of being emitted here.
    pub(crate) fn note_switch(&mut self, id: ProgramId) {
        if self.current == Some(id) {
            self.previous = None;
            return;
        }
        if self.current.is_some() {
            self.previous = self.current;
        }
        self.current = Some(id);
    }

    /// Input-side bare `<PSW>`: swap back to the previous program.
    /// Returns the program that became current, if there was one to swap to.
    pub(crate) fn note_swap(&mut self) -> Option<ProgramId> {
        let target = self.previous?;
        self.previous = self.current;
        self.current = Some(target);
        Some(target)
    }

    fn check_description(descr: &str) -> Result<()> {
        if !EscapeStyle::MIXED.is_free(descr.as_bytes()) {
            return Err(MulttyError::InvalidArgument(
                "description contains escapable bytes",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;
    use std::fs::File;
    use std::io::Read;

    fn pipe_channel() -> (Channel, File) {
        let (rd, wr) = pipe().expect("pipe");
        (Channel::with_limit(wr, 512), File::from(rd))
    }

    fn id(name: &str, descr: bool) -> ProgramId {
        ProgramId::new(name, descr).expect("identity")
    }

    #[test]
    fn test_identity_with_and_without_description_differ() {
        let plain = id("svc", false);
        let described = id("svc", true);
        assert_ne!(plain, described);
        assert_eq!(plain.name(), b"svc");
        assert_eq!(described.name(), b"svc");
        assert!(described.has_description());
        assert_eq!(plain.wire_bytes(), b"svc");
        assert_eq!(described.wire_bytes(), b"svc\x1f");

        let mut set = ProgramSet::new();
        set.have(plain, None).expect("have plain");
        set.have(described, Some("a service")).expect("have described");
        assert_eq!(set.len(), 2);
        assert!(set.find(&plain).is_some());
        assert_eq!(
            set.find(&described).and_then(|p| p.description()),
            Some("a service")
        );
    }

    #[test]
    fn test_identity_validation() {
        assert!(ProgramId::new(&"x".repeat(33), false).is_err());
        assert!(ProgramId::new("bad\x01name", false).is_err());
        assert!(ProgramId::new("bad\x1fname", false).is_err());
        assert!(ProgramId::new(&"x".repeat(32), true).is_ok());
    }

    #[test]
    fn test_have_is_idempotent_and_redescribes() {
        let mut set = ProgramSet::new();
        let pid = id("pager", true);
        set.have(pid, Some("first")).expect("have");
        set.have(pid, None).expect("share");
        assert_eq!(set.find(&pid).and_then(|p| p.description()), Some("first"));
        set.have(pid, Some("second")).expect("redescribe");
        assert_eq!(set.find(&pid).and_then(|p| p.description()), Some("second"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_description_validation() {
        let mut set = ProgramSet::new();
        let pid = id("svc", true);
        assert!(set.have(pid, Some("bad\x01descr")).is_err());
        assert!(set.find(&pid).is_none(), "no partial state after failure");

        set.have(pid, Some("ok")).expect("have");
        assert!(set.describe(&pid, "with \x00 nul").is_err());
        assert!(set.describe(&pid, "still fine").is_ok());

        let bare = id("svc", false);
        set.have(bare, None).expect("have bare");
        assert!(set.describe(&bare, "not welcome").is_err());
    }

    #[test]
    fn test_switch_mru_encodings() {
        let (ch, mut rd) = pipe_channel();
        let mut set = ProgramSet::new();
        let a = id("a", false);
        let b = id("b", false);
        let c = id("c", false);
        for pid in [a, b, c] {
            set.have(pid, None).expect("have");
        }

        // First switches are full sequences.
        set.switch_to(&ch, &a).expect("to a");
        set.switch_to(&ch, &b).expect("to b");
        // Back to a: b was current, a was previous, so a bare <PSW>.
        set.switch_to(&ch, &a).expect("back to a");
        // c was never current or previous: full sequence again.
        set.switch_to(&ch, &c).expect("to c");

        let mut wire = vec![0u8; 3 + 3 + 1 + 3];
        rd.read_exact(&mut wire).expect("read");
        assert_eq!(
            wire,
            [
                0x01, b'a', 0x14, // full switch to a
                0x01, b'b', 0x14, // full switch to b
                0x14, // swap back to a
                0x01, b'c', 0x14, // full switch to c
            ]
        );
        assert_eq!(set.current().map(|p| *p.id()), Some(c));
        assert_eq!(set.previous().map(|p| *p.id()), Some(a));
    }

    #[test]
    fn test_switch_to_current_clears_previous_silently() {
        let (ch, mut rd) = pipe_channel();
        let mut set = ProgramSet::new();
        let a = id("a", false);
        let b = id("b", false);
        set.have(a, None).expect("have");
        set.have(b, None).expect("have");
        set.switch_to(&ch, &a).expect("to a");
        set.switch_to(&ch, &b).expect("to b");
        set.switch_to(&ch, &b).expect("again to b");
        assert!(set.previous().is_none());

        // Nothing extra went on the wire for the repeated switch.
        let mut wire = vec![0u8; 6];
        rd.read_exact(&mut wire).expect("read");
        assert_eq!(wire, [0x01, b'a', 0x14, 0x01, b'b', 0x14]);
    }

    #[test]
    fn test_switch_carries_description() {
        let (ch, mut rd) = pipe_channel();
        let mut set = ProgramSet::new();
        let pid = id("sh", true);
        set.have(pid, Some("login shell")).expect("have");
        set.switch_to(&ch, &pid).expect("switch");

        let mut wire = vec![0u8; 1 + 3 + 11 + 1];
        rd.read_exact(&mut wire).expect("read");
        assert_eq!(&wire[..1], [0x01]);
        assert_eq!(&wire[1..4], b"sh\x1f");
        assert_eq!(&wire[4..15], b"login shell");
        assert_eq!(&wire[15..], [0x14]);
    }

    #[test]
    fn test_remove_clears_mru_pointers() {
        let (ch, _rd) = pipe_channel();
        let mut set = ProgramSet::new();
        let a = id("a", false);
        let b = id("b", false);
        set.have(a, None).expect("have");
        set.have(b, None).expect("have");
        set.switch_to(&ch, &a).expect("to a");
        set.switch_to(&ch, &b).expect("to b");

        set.remove(&a);
        assert!(set.previous().is_none());
        set.remove(&b);
        assert!(set.current().is_none());
        // Removing again is a silent no-op.
        set.remove(&b);
        assert!(set.is_empty());
    }

    #[test]
    fn test_switch_to_unknown_program_fails() {
        let (ch, _rd) = pipe_channel();
        let mut set = ProgramSet::new();
        let ghost = id("ghost", false);
        assert!(matches!(
            set.switch_to(&ch, &ghost),
            Err(MulttyError::InvalidArgument(_))
        ));
    }
}
