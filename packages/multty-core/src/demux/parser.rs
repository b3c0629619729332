//! The pure unit recognizer behind [`super::InputFlow`].
//!
//! One call to [`step`] inspects the front of the buffered input and
//! classifies exactly one thing: a complete wire unit, a malformed span to
//! discard, or "not enough bytes yet". It never does I/O and never mutates
//! anything, which keeps the recovery rules testable in isolation.
//!
//! Recognizers run in a fixed order: name detection first, then stream
//! control, program control and finally the application run, which soaks up
//! the longest span that none of the others claim.

use crate::codes;
use crate::escape::EscapeStyle;

/// A stream or program name parsed from a `<SOH>` prefix. The `<US>`
/// separator, when present, splits the tightly validated identity from the
/// free-form description.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct NameSpan<'a> {
    pub identity: &'a [u8],
    pub description: Option<&'a [u8]>,
}

/// The four program-multiplexing verbs, `<DC1>` through `<DC4>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProgramOp {
    /// `<DC1>`: push context up to the parent.
    Up,
    /// `<DC2>`: remove the addressed (or current) program.
    Remove,
    /// `<DC3>`: push context down to a child.
    Down,
    /// `<DC4>`: switch focus to the addressed program, or swap back.
    Switch,
}

/// One recognized wire unit, borrowing from the input buffer.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Unit<'a> {
    /// `<SO>`/`<SI>`, optionally name-addressed.
    Shift { name: Option<NameSpan<'a>>, out: bool },
    /// `<EM>`: ends the named or current stream, or the program context
    /// when no stream is current. The distinction is the flow's to make.
    End { name: Option<NameSpan<'a>> },
    /// One of the `<DC1>`..`<DC4>` program verbs.
    Program {
        op: ProgramOp,
        name: Option<NameSpan<'a>>,
    },
    /// Application bytes, still escaped, ended by `terminator` (`<NUL>`
    /// when the run simply hit the end of the buffer). The terminator byte
    /// is *not* part of the consumed span; it becomes its own unit.
    Run { data: &'a [u8], terminator: u8 },
}

/// Outcome of one recognition attempt at the front of the buffer.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Step<'a> {
    /// Nothing conclusive yet; wait for more input.
    NeedMore,
    /// The first `len` bytes are malformed; `bad` is the offending byte.
    Discard { len: usize, bad: u8 },
    /// A complete unit spanning the first `consumed` bytes.
    Unit { consumed: usize, unit: Unit<'a> },
}

/// Recognize one unit at the front of `input`.
pub(crate) fn step(input: &[u8]) -> Step<'_> {
    let Some(&first) = input.first() else {
        return Step::NeedMore;
    };
    match first {
        codes::SOH => step_named(input),
        codes::SO | codes::SI => Step::Unit {
            consumed: 1,
            unit: Unit::Shift {
                name: None,
                out: first == codes::SO,
            },
        },
        codes::EM => Step::Unit {
            consumed: 1,
            unit: Unit::End { name: None },
        },
        codes::PUP..=codes::PSW => Step::Unit {
            consumed: 1,
            unit: Unit::Program {
                op: program_op(first),
                name: None,
            },
        },
        _ => step_run(input),
    }
}

fn program_op(verb: u8) -> ProgramOp {
    match verb {
        codes::PUP => ProgramOp::Up,
        codes::PRM => ProgramOp::Remove,
        codes::PDN => ProgramOp::Down,
        _ => ProgramOp::Switch,
    }
}

/// `<SOH>`-prefixed unit: scan out the name, then dispatch on the verb
/// that terminated it.
///
/// Before a `<US>` the terminator is anything `BINARY` would escape; after
/// it, anything `MIXED` would escape. A terminator that is not a known verb
/// means the `<SOH>` itself was bogus; it alone is dropped so the following
/// bytes get a fresh chance as ordinary data.
fn step_named(input: &[u8]) -> Step<'_> {
    let mut i = 1;
    let mut us: Option<usize> = None;
    let verb = loop {
        let Some(&b) = input.get(i) else {
            // Name still incomplete: stay in name-pending.
            return Step::NeedMore;
        };
        let style = if us.is_none() {
            EscapeStyle::BINARY
        } else {
            EscapeStyle::MIXED
        };
        if style.escapes(b) {
            if b == codes::US && us.is_none() {
                us = Some(i);
                i += 1;
                continue;
            }
            break b;
        }
        i += 1;
    };
    let name = NameSpan {
        identity: &input[1..us.unwrap_or(i)],
        description: us.map(|u| &input[u + 1..i]),
    };
    let consumed = i + 1;
    let unit = match verb {
        codes::SO | codes::SI => Unit::Shift {
            name: Some(name),
            out: verb == codes::SO,
        },
        codes::EM => Unit::End { name: Some(name) },
        codes::PUP..=codes::PSW => Unit::Program {
            op: program_op(verb),
            name: Some(name),
        },
        bad => return Step::Discard { len: 1, bad },
    };
    Step::Unit { consumed, unit }
}

/// Escaped values tolerated after `<DLE>`: the control range shifted to
/// 0x40..=0x5f, plus `<DEL>` at 0x3f and `<IAC>` at 0xbf.
fn tolerated_escape(b: u8) -> bool {
    (0x40..=0x5f).contains(&b) || b == 0x3f || b == 0xbf
}

/// Control bytes with no raw meaning on the wire: everything the `ASCII`
/// style escapes, minus the structural verbs handled before this check.
fn must_be_escaped(b: u8) -> bool {
    EscapeStyle::ASCII.escapes(b)
}

/// The longest application-byte span from the front of `input`.
fn step_run(input: &[u8]) -> Step<'_> {
    let mut i = 0;
    let mut terminator = codes::NUL;
    while i < input.len() {
        let b = input[i];
        match b {
            codes::SOH | codes::SO | codes::SI | codes::EM | codes::PUP..=codes::PSW => {
                terminator = b;
                break;
            }
            codes::DLE => match input.get(i + 1) {
                // Lone trailing <DLE>: defer the pair to the next read.
                None => break,
                Some(&e) if tolerated_escape(e) => i += 2,
                Some(&e) => {
                    if i == 0 {
                        return Step::Discard { len: 2, bad: e };
                    }
                    // Deliver the good span first; the bad pair is the
                    // next step's discard.
                    break;
                }
            },
            b if must_be_escaped(b) => {
                if i == 0 {
                    return Step::Discard { len: 1, bad: b };
                }
                break;
            }
            _ => i += 1,
        }
    }
    if i == 0 {
        // Only a dangling <DLE> is buffered.
        return Step::NeedMore;
    }
    Step::Unit {
        consumed: i,
        unit: Unit::Run {
            data: &input[..i],
            terminator,
        },
    }
}
