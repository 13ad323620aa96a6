//! Bit-exact conversion between packed signal storage and the textual and
//! binary value formats of the standard.
//!
//! Storage is little-endian packed: bit 0 of an element lives in bit 0 of its
//! first byte. All renderings walk the element as a byte slice, so the same
//! window arithmetic serves every lane kind from `U8` through `Wide`.

use std::{error, fmt};

use crate::model::VarKind;
use crate::schema::values::ValueFormat;

/// Capacity of one rendered text value, in characters. Renderings that would
/// exceed it are truncated to their least-significant portion.
pub(crate) const TEXT_CAP: usize = MAX_STRING_WORDS * 32;

/// Static sizing of the text return buffer, in 32-bit words.
pub(crate) const MAX_STRING_WORDS: usize = 64;

/// Largest lane count a vector read may produce; exceeding it means the
/// model and the runtime disagree about storage sizing, which is fatal.
pub(crate) const MAX_VECTOR_WORDS: usize = 64;

/// One `s_vpi_vecval` lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Lane {
    pub aval: u32,
    pub bval: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// (format, lane kind) pair the marshaller does not implement.
    Unsupported(ValueFormat, VarKind),
    /// Text rendering clipped to the static buffer.
    Truncated { bits: u32, cap: usize },
    /// Vector read wider than the static lane limit.
    LaneOverflow { words: usize },
    /// Decimal write with no leading digits.
    BadDecimal,
    /// Decimal write with characters after the number.
    TrailingGarbage,
    /// Non-digit character in a hex or octal write, treated as zero.
    BadDigit(char),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported(format, kind) => {
                write!(f, "unsupported format {format:?} for {kind:?} storage")
            }
            Self::Truncated { bits, cap } => {
                write!(f, "value of {bits} bits truncated to {cap} characters")
            }
            Self::LaneOverflow { words } => {
                write!(f, "vector of {words} lanes exceeds the {MAX_VECTOR_WORDS} lane limit")
            }
            Self::BadDecimal => f.write_str("decimal string has no digits"),
            Self::TrailingGarbage => f.write_str("ignoring characters after decimal number"),
            Self::BadDigit(ch) => write!(f, "non-digit character '{ch}' treated as zero"),
        }
    }
}

impl error::Error for Error {}

/// Everything the marshaller needs to touch one element: lane kind, declared
/// width, stride, low-lane mask, and the element's storage base.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Access {
    pub kind: VarKind,
    pub bits: u32,
    pub stride: usize,
    pub mask: u32,
    pub ptr: *mut u8,
}

impl Access {
    fn bytes(&self) -> &[u8] {
        // SAFETY: `ptr` obeys the StoragePtr contract: `stride` bytes, live
        // for the installed runtime, single-threaded access.
        unsafe { std::slice::from_raw_parts(self.ptr, self.stride) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `bytes`, and writes only happen on the put path with
        // the runtime borrowed uniquely.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.stride) }
    }

    fn mask64(&self) -> u64 {
        if self.bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.bits) - 1
        }
    }

    /// Copy of the element's current storage bytes.
    pub(crate) fn snapshot(&self) -> Vec<u8> {
        self.bytes().to_vec()
    }
}

/// A value read out of storage. Text renderings carry raw bytes without the
/// terminating NUL; the ABI layer appends it when staging the return buffer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Rendered {
    Int(i32),
    Lanes(Vec<Lane>),
    Text { bytes: Vec<u8>, truncated: bool },
}

fn byte_at(bytes: &[u8], index: usize) -> u8 {
    bytes.get(index).copied().unwrap_or(0)
}

fn bit_at(bytes: &[u8], bit: u32) -> u8 {
    (byte_at(bytes, (bit >> 3) as usize) >> (bit & 7)) & 1
}

/// Read a window of up to 8 bits starting at `start`, spanning at most two
/// bytes.
fn window(bytes: &[u8], start: u32, width: u32) -> u32 {
    let lo = (start >> 3) as usize;
    let shift = start & 7;
    let mut w = u32::from(byte_at(bytes, lo)) >> shift;
    if shift != 0 {
        w |= u32::from(byte_at(bytes, lo + 1)) << (8 - shift);
    }
    w & ((1 << width) - 1)
}

/// OR a window of up to 8 bits into storage, carrying into the next byte.
fn or_window(bytes: &mut [u8], start: u32, width: u32, value: u32) {
    let lo = (start >> 3) as usize;
    let shift = start & 7;
    if lo < bytes.len() {
        bytes[lo] |= (value << shift) as u8;
    }
    if shift + width > 8 && lo + 1 < bytes.len() {
        bytes[lo + 1] |= (value >> (8 - shift)) as u8;
    }
}

/// Clear every bit at or above `bits`, so string writes can OR windows that
/// overhang the declared width.
fn mask_tail(bytes: &mut [u8], bits: u32) {
    let full = (bits >> 3) as usize;
    let rem = bits & 7;
    if rem != 0 && full < bytes.len() {
        bytes[full] &= (1 << rem) - 1;
    }
    let first_clear = full + usize::from(rem != 0);
    for b in bytes.iter_mut().skip(first_clear) {
        *b = 0;
    }
}

fn uint_from_le(bytes: &[u8], len: usize) -> u64 {
    let mut v = 0u64;
    for i in (0..len).rev() {
        v = (v << 8) | u64::from(byte_at(bytes, i));
    }
    v
}

/// Read the element in `format`. Truncated text renderings are returned with
/// the flag set so the caller can record the warning.
pub(crate) fn read_value(access: &Access, format: ValueFormat) -> Result<Rendered, Error> {
    let bytes = access.bytes();
    let bits = access.bits;
    match format {
        ValueFormat::Int => match access.kind {
            VarKind::U8 | VarKind::U16 | VarKind::U32 => {
                Ok(Rendered::Int(uint_from_le(bytes, 4) as i32))
            }
            VarKind::U64 | VarKind::Wide => Err(Error::Unsupported(format, access.kind)),
        },
        ValueFormat::Vector => {
            let words = bits.div_ceil(32).max(1) as usize;
            if words > MAX_VECTOR_WORDS {
                return Err(Error::LaneOverflow { words });
            }
            let lanes = (0..words)
                .map(|w| Lane {
                    aval: uint_from_le(&bytes[(4 * w).min(bytes.len())..], 4) as u32,
                    bval: 0,
                })
                .collect();
            Ok(Rendered::Lanes(lanes))
        }
        ValueFormat::BinStr => {
            let (chars, truncated) = clip(bits as usize);
            let mut out = vec![0u8; chars];
            for i in 0..chars as u32 {
                out[chars - 1 - i as usize] = b'0' + bit_at(bytes, i);
            }
            Ok(Rendered::Text { bytes: out, truncated })
        }
        ValueFormat::OctStr => {
            let (chars, truncated) = clip(bits.div_ceil(3) as usize);
            let mut out = vec![0u8; chars];
            for d in 0..chars as u32 {
                let width = 3.min(bits - 3 * d);
                out[chars - 1 - d as usize] = b'0' + window(bytes, 3 * d, width) as u8;
            }
            Ok(Rendered::Text { bytes: out, truncated })
        }
        ValueFormat::HexStr => {
            let (chars, truncated) = clip(bits.div_ceil(4) as usize);
            let mut out = vec![0u8; chars];
            for d in 0..chars as u32 {
                let width = 4.min(bits - 4 * d);
                let nibble = window(bytes, 4 * d, width) as usize;
                out[chars - 1 - d as usize] = b"0123456789abcdef"[nibble];
            }
            Ok(Rendered::Text { bytes: out, truncated })
        }
        ValueFormat::DecStr => {
            let len = match access.kind {
                VarKind::U8 => 1,
                VarKind::U16 => 2,
                VarKind::U32 => 4,
                VarKind::U64 => 8,
                VarKind::Wide => return Err(Error::Unsupported(format, access.kind)),
            };
            Ok(Rendered::Text {
                bytes: uint_from_le(bytes, len).to_string().into_bytes(),
                truncated: false,
            })
        }
        ValueFormat::String => {
            let (chars, truncated) = clip(bits.div_ceil(8) as usize);
            let mut out = vec![0u8; chars];
            for i in 0..chars {
                let b = byte_at(bytes, chars - 1 - i);
                out[i] = if b == 0 { b' ' } else { b };
            }
            Ok(Rendered::Text { bytes: out, truncated })
        }
        _ => Err(Error::Unsupported(format, access.kind)),
    }
}

fn clip(chars: usize) -> (usize, bool) {
    if chars > TEXT_CAP {
        (TEXT_CAP, true)
    } else {
        (chars, false)
    }
}

/// Input to a write, matching the union arm selected by the format.
#[derive(Debug, Clone, Copy)]
pub(crate) enum WriteInput<'a> {
    Int(i32),
    Lanes(&'a [Lane]),
    Text(&'a [u8]),
}

/// Write the element in `format`. `Ok(Some(_))` means the write happened but
/// a warning should be recorded; `Err(_)` means nothing was written (or, for
/// a failed decimal parse, the element is unchanged).
pub(crate) fn write_value(
    access: &mut Access,
    format: ValueFormat,
    input: WriteInput<'_>,
) -> Result<Option<Error>, Error> {
    match (format, input) {
        (ValueFormat::Int, WriteInput::Int(value)) => match access.kind {
            VarKind::U8 | VarKind::U16 | VarKind::U32 => {
                store_low(access, value as u32 & access.mask);
                Ok(None)
            }
            VarKind::U64 | VarKind::Wide => Err(Error::Unsupported(format, access.kind)),
        },
        (ValueFormat::Vector, WriteInput::Lanes(lanes)) => {
            let lane = |w: usize| lanes.get(w).copied().unwrap_or_default().aval;
            match access.kind {
                VarKind::U8 | VarKind::U16 | VarKind::U32 => {
                    store_low(access, lane(0) & access.mask);
                }
                VarKind::U64 => {
                    let q = (u64::from(lane(1)) << 32 | u64::from(lane(0))) & access.mask64();
                    access.bytes_mut()[..8].copy_from_slice(&q.to_le_bytes());
                }
                VarKind::Wide => {
                    let words = access.bits.div_ceil(32) as usize;
                    let bits = access.bits;
                    let bytes = access.bytes_mut();
                    for w in 0..words {
                        bytes[4 * w..4 * w + 4].copy_from_slice(&lane(w).to_le_bytes());
                    }
                    mask_tail(bytes, bits);
                }
            }
            Ok(None)
        }
        (ValueFormat::BinStr, WriteInput::Text(text)) => {
            let bits = access.bits;
            let bytes = access.bytes_mut();
            bytes.fill(0);
            for i in 0..bits {
                let i = i as usize;
                if i < text.len() && text[text.len() - 1 - i] == b'1' {
                    bytes[i >> 3] |= 1 << (i & 7);
                }
            }
            Ok(None)
        }
        (ValueFormat::OctStr, WriteInput::Text(text)) => {
            let bits = access.bits;
            let mut warning = None;
            let bytes = access.bytes_mut();
            bytes.fill(0);
            for d in 0..bits.div_ceil(3) {
                let ch = digit_from_end(text, d as usize);
                let value = match ch {
                    b'0'..=b'7' => u32::from(ch - b'0'),
                    _ => {
                        warning.get_or_insert(Error::BadDigit(ch as char));
                        0
                    }
                };
                or_window(bytes, 3 * d, 3, value);
            }
            mask_tail(bytes, bits);
            Ok(warning)
        }
        (ValueFormat::HexStr, WriteInput::Text(text)) => {
            let text = text
                .strip_prefix(b"0x")
                .or_else(|| text.strip_prefix(b"0X"))
                .unwrap_or(text);
            let bits = access.bits;
            let mut warning = None;
            let bytes = access.bytes_mut();
            bytes.fill(0);
            for d in 0..bits.div_ceil(4) as usize {
                let ch = digit_from_end(text, d);
                let value = match (ch as char).to_digit(16) {
                    Some(v) => v,
                    None => {
                        warning.get_or_insert(Error::BadDigit(ch as char));
                        0
                    }
                };
                bytes[d >> 1] |= (value << ((d & 1) * 4)) as u8;
            }
            mask_tail(bytes, bits);
            Ok(warning)
        }
        (ValueFormat::DecStr, WriteInput::Text(text)) => {
            if access.kind == VarKind::Wide {
                return Err(Error::Unsupported(format, access.kind));
            }
            let digits = text.iter().skip_while(|b| b.is_ascii_whitespace());
            let mut value = 0u64;
            let mut seen = 0usize;
            let mut rest = 0usize;
            for &b in digits {
                if b.is_ascii_digit() && rest == 0 {
                    value = value.wrapping_mul(10).wrapping_add(u64::from(b - b'0'));
                    seen += 1;
                } else {
                    rest += 1;
                }
            }
            if seen == 0 {
                return Err(Error::BadDecimal);
            }
            let value = value & access.mask64();
            match access.kind {
                VarKind::U64 => access.bytes_mut()[..8].copy_from_slice(&value.to_le_bytes()),
                _ => store_low(access, value as u32 & access.mask),
            }
            Ok((rest != 0).then_some(Error::TrailingGarbage))
        }
        (ValueFormat::String, WriteInput::Text(text)) => {
            let chars = access.bits.div_ceil(8) as usize;
            let bits = access.bits;
            let bytes = access.bytes_mut();
            bytes.fill(0);
            for i in 0..chars.min(bytes.len()) {
                if i < text.len() {
                    bytes[i] = text[text.len() - 1 - i];
                }
            }
            mask_tail(bytes, bits);
            Ok(None)
        }
        (format, _) => Err(Error::Unsupported(format, access.kind)),
    }
}

/// Character `d` positions from the end of the string, `'0'` past its start.
fn digit_from_end(text: &[u8], d: usize) -> u8 {
    if d < text.len() {
        text[text.len() - 1 - d]
    } else {
        b'0'
    }
}

fn store_low(access: &mut Access, value: u32) {
    let len = access.stride.min(4);
    let le = value.to_le_bytes();
    access.bytes_mut()[..len].copy_from_slice(&le[..len]);
}

#[cfg(test)]
fn test_access(kind: VarKind, bits: u32, buf: &mut [u8]) -> Access {
    let stride = kind.stride(bits);
    assert!(buf.len() >= stride);
    Access {
        kind,
        bits,
        stride,
        mask: if bits >= 32 { u32::MAX } else { (1 << bits) - 1 },
        ptr: buf.as_mut_ptr(),
    }
}

#[test]
fn test_int_round_trip() {
    let mut buf = [0u8; 4];
    let mut a = test_access(VarKind::U16, 10, &mut buf);
    assert_eq!(write_value(&mut a, ValueFormat::Int, WriteInput::Int(0x5a5)), Ok(None));
    assert_eq!(read_value(&a, ValueFormat::Int), Ok(Rendered::Int(0x5a5)));
    // Masked to the declared 10 bits.
    assert_eq!(write_value(&mut a, ValueFormat::Int, WriteInput::Int(-1)), Ok(None));
    assert_eq!(read_value(&a, ValueFormat::Int), Ok(Rendered::Int(0x3ff)));
}

#[test]
fn test_int_rejects_wide_kinds() {
    let mut buf = [0u8; 8];
    let a = test_access(VarKind::U64, 40, &mut buf);
    assert_eq!(
        read_value(&a, ValueFormat::Int),
        Err(Error::Unsupported(ValueFormat::Int, VarKind::U64))
    );
}

#[test]
fn test_bin_str_both_ways() {
    let mut buf = [0u8; 1];
    let mut a = test_access(VarKind::U8, 5, &mut buf);
    assert_eq!(
        write_value(&mut a, ValueFormat::BinStr, WriteInput::Text(b"101")),
        Ok(None)
    );
    assert_eq!(buf[0], 0b101);
    let a = test_access(VarKind::U8, 5, &mut buf);
    match read_value(&a, ValueFormat::BinStr).unwrap() {
        Rendered::Text { bytes, truncated } => {
            assert_eq!(bytes, b"00101");
            assert!(!truncated);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_oct_str_spans_bytes() {
    // 9-bit value: the top octal digit's window straddles the byte boundary.
    let mut buf = [0u8; 2];
    let mut a = test_access(VarKind::U16, 9, &mut buf);
    assert_eq!(
        write_value(&mut a, ValueFormat::OctStr, WriteInput::Text(b"725")),
        Ok(None)
    );
    // 0b111_010_101 little-endian packed.
    assert_eq!(buf, [0xd5, 0x01]);
    let a = test_access(VarKind::U16, 9, &mut buf);
    match read_value(&a, ValueFormat::OctStr).unwrap() {
        Rendered::Text { bytes, truncated } => {
            assert_eq!(bytes, b"725");
            assert!(!truncated);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_hex_str_prefix_mask_and_bad_digit() {
    let mut buf = [0u8; 1];
    let mut a = test_access(VarKind::U8, 8, &mut buf);
    assert_eq!(
        write_value(&mut a, ValueFormat::HexStr, WriteInput::Text(b"0x1ff")),
        Ok(None)
    );
    assert_eq!(buf[0], 0xff);

    let mut a = test_access(VarKind::U8, 8, &mut buf);
    assert_eq!(
        write_value(&mut a, ValueFormat::HexStr, WriteInput::Text(b"g5")),
        Ok(Some(Error::BadDigit('g')))
    );
    assert_eq!(buf[0], 0x05);

    let a = test_access(VarKind::U8, 8, &mut buf);
    match read_value(&a, ValueFormat::HexStr).unwrap() {
        Rendered::Text { bytes, .. } => assert_eq!(bytes, b"05"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_dec_str_parse_rules() {
    let mut buf = [0u8; 2];
    let mut a = test_access(VarKind::U16, 16, &mut buf);
    assert_eq!(
        write_value(&mut a, ValueFormat::DecStr, WriteInput::Text(b"42")),
        Ok(None)
    );
    assert_eq!(read_value(&a, ValueFormat::Int), Ok(Rendered::Int(42)));
    match read_value(&a, ValueFormat::DecStr).unwrap() {
        Rendered::Text { bytes, .. } => assert_eq!(bytes, b"42"),
        other => panic!("unexpected {other:?}"),
    }

    assert_eq!(
        write_value(&mut a, ValueFormat::DecStr, WriteInput::Text(b"  7 trailing")),
        Ok(Some(Error::TrailingGarbage))
    );
    assert_eq!(read_value(&a, ValueFormat::Int), Ok(Rendered::Int(7)));

    assert_eq!(
        write_value(&mut a, ValueFormat::DecStr, WriteInput::Text(b"x")),
        Err(Error::BadDecimal)
    );
    assert_eq!(read_value(&a, ValueFormat::Int), Ok(Rendered::Int(7)));
}

#[test]
fn test_string_byte_reversal_and_padding() {
    let mut buf = [0u8; 4];
    let mut a = test_access(VarKind::U32, 32, &mut buf);
    assert_eq!(
        write_value(&mut a, ValueFormat::String, WriteInput::Text(b"hi")),
        Ok(None)
    );
    assert_eq!(&buf, &[b'i', b'h', 0, 0]);
    let a = test_access(VarKind::U32, 32, &mut buf);
    match read_value(&a, ValueFormat::String).unwrap() {
        // Padding nulls render as spaces, leading.
        Rendered::Text { bytes, .. } => assert_eq!(bytes, b"  hi"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_vector_lanes_little_endian() {
    let mut buf = [0u8; 12];
    let mut a = test_access(VarKind::Wide, 70, &mut buf);
    let lanes = [
        Lane { aval: 0x0403_0201, bval: 0 },
        Lane { aval: 0x0807_0605, bval: 0 },
        Lane { aval: u32::MAX, bval: 0 },
    ];
    assert_eq!(
        write_value(&mut a, ValueFormat::Vector, WriteInput::Lanes(&lanes)),
        Ok(None)
    );
    match read_value(&a, ValueFormat::Vector).unwrap() {
        Rendered::Lanes(out) => {
            assert_eq!(out.len(), 3);
            assert_eq!(out[0].aval, 0x0403_0201);
            assert_eq!(out[1].aval, 0x0807_0605);
            // Top lane masked to the 6 declared bits.
            assert_eq!(out[2].aval, 0x3f);
            assert!(out.iter().all(|l| l.bval == 0));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_u64_vector_combines_two_lanes() {
    let mut buf = [0u8; 8];
    let mut a = test_access(VarKind::U64, 48, &mut buf);
    let lanes = [Lane { aval: 0xdead_beef, bval: 0 }, Lane { aval: 0xffff_1234, bval: 0 }];
    assert_eq!(
        write_value(&mut a, ValueFormat::Vector, WriteInput::Lanes(&lanes)),
        Ok(None)
    );
    assert_eq!(uint_from_le(&buf, 8), 0x1234_dead_beef);
}

#[test]
fn test_bin_str_read_truncates() {
    let bits = (TEXT_CAP + 8) as u32;
    let mut buf = vec![0xffu8; VarKind::Wide.stride(bits)];
    let a = test_access(VarKind::Wide, bits, &mut buf);
    match read_value(&a, ValueFormat::BinStr).unwrap() {
        Rendered::Text { bytes, truncated } => {
            assert!(truncated);
            assert_eq!(bytes.len(), TEXT_CAP);
        }
        other => panic!("unexpected {other:?}"),
    }
}
