//! Byte escaping for the mulTTY wire.
//!
//! Escaping is always a `<DLE>` prefix plus the byte XOR 0x40: control codes
//! land in 0x40..=0x5f, `<DEL>` becomes 0x3f and the Telnet `<IAC>` byte
//! becomes 0xbf. Which control codes *need* escaping depends on the payload
//! class, expressed as an [`EscapeStyle`] bitmask.
//!
//! Escaping is NOT idempotent: `<DLE>` itself gets escaped, so escaping an
//! already escaped buffer changes it again. Escape exactly once per
//! transmission and unescape exactly once per reception.

use crate::codes;

/// Escape policy: one bit per control-code value 0x00..=0x1f.
///
/// A set bit means "this control code must be escaped". Two bytes outside
/// the control range are remapped into it before testing: `<DEL>` (0x7f)
/// shares the slot of `<BS>` (0x08) and `<IAC>` (0xff) shares the slot of
/// `<NUL>` (0x00). Bytes at or above 0x20 are never escaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscapeStyle(pub u32);

impl EscapeStyle {
    /// Payload is already mulTTY-aware; nothing is escaped.
    pub const MULTTY: Self = Self(0);

    /// Legacy ASCII text, not yet mulTTY-aware: escape only the codes that
    /// mulTTY interprets structurally, leaving common text controls
    /// (`<TAB>`, `<LF>`, `<CR>`, `<BEL>`, `<ESC>`...) alone.
    pub const ASCII: Self = Self(
        (1 << 1)
            | (1 << 2)
            | (1 << 3)
            | (1 << 4)
            | (1 << 5)
            | (1 << 6)
            | (1 << 16)
            | (1 << 17)
            | (1 << 18)
            | (1 << 19)
            | (1 << 20)
            | (1 << 21)
            | (1 << 22)
            | (1 << 23)
            | (1 << 24)
            | (1 << 25)
            | (1 << 28)
            | (1 << 29)
            | (1 << 30)
            | (1 << 31),
    );

    /// [`EscapeStyle::ASCII`] plus `<NUL>` (and, via the remap, `<IAC>`).
    /// Used for text embedded inside framed structures, where a smuggled
    /// `<NUL>` could hijack the stream.
    pub const MIXED: Self = Self(Self::ASCII.0 | 1);

    /// Untrusted arbitrary bytes: escape every control-range value.
    pub const BINARY: Self = Self(0xffff_ffff);

    /// Whether `byte` must be escaped under this style.
    ///
    /// Applies the `<DEL>`/`<IAC>` remap first, then tests the style bit
    /// for remapped values below 0x20; everything else passes freely.
    #[inline]
    pub fn escapes(self, byte: u8) -> bool {
        let probe = match byte {
            codes::DEL => 0x08,
            codes::IAC => 0x00,
            b => b,
        };
        probe < 0x20 && (self.0 & (1u32 << probe)) != 0
    }

    /// True iff no byte in `bytes` wants escaping under this style.
    ///
    /// This is the sole defense against a malicious stream name, program
    /// identity or description smuggling a structural control code into a
    /// framed structure, so it is checked before any such text is embedded
    /// unescaped.
    pub fn is_free(self, bytes: &[u8]) -> bool {
        bytes.iter().all(|&b| !self.escapes(b))
    }
}

/// Escape `src` under `style`, appending to `dest` without letting it grow
/// past `capacity` bytes.
///
/// Returns the number of *source* bytes consumed, not destination bytes
/// written. A return of 0 is not an error: it signals a full buffer, after
/// which the caller should flush and retry.
pub fn escape_into(style: EscapeStyle, dest: &mut Vec<u8>, capacity: usize, src: &[u8]) -> usize {
    let mut done = 0;
    for &b in src {
        let esc = style.escapes(b);
        let need = if esc { 2 } else { 1 };
        if dest.len() + need > capacity {
            break;
        }
        if esc {
            dest.push(codes::DLE);
            dest.push(b ^ 0x40);
        } else {
            dest.push(b);
        }
        done += 1;
    }
    done
}

/// Reverses the `<DLE>`/XOR-0x40 pairing across chunk boundaries.
///
/// A lone trailing `<DLE>` at the end of one chunk is carried over and
/// resolved against the first byte of the next chunk.
#[derive(Debug, Default, Clone)]
pub struct Unescaper {
    carry_dle: bool,
}

impl Unescaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the previous chunk ended in an unresolved `<DLE>`.
    pub fn pending(&self) -> bool {
        self.carry_dle
    }

    /// Unescape `src` into `dest`, returning the number of bytes appended.
    pub fn unescape_into(&mut self, dest: &mut Vec<u8>, src: &[u8]) -> usize {
        let before = dest.len();
        for &b in src {
            if self.carry_dle {
                dest.push(b ^ 0x40);
                self.carry_dle = false;
            } else if b == codes::DLE {
                self.carry_dle = true;
            } else {
                dest.push(b);
            }
        }
        dest.len() - before
    }
}
