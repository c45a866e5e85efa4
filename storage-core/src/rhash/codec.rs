//! BCD numeric/date packing and zlib wrap/unwrap (spec.md section 4.5).

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Error, Result};

const MAX_SYMBOLS: usize = 30;

fn numeric_symbol(c: char) -> Option<u8> {
    Some(match c {
        '1'..='9' => c as u8 - b'0',
        '0' => 10,
        '.' => 11,
        '+' => 12,
        '-' => 13,
        'e' => 14,
        _ => return None,
    })
}

fn numeric_char(nibble: u8) -> Option<char> {
    Some(match nibble {
        1..=9 => (b'0' + nibble) as char,
        10 => '0',
        11 => '.',
        12 => '+',
        13 => '-',
        14 => 'e',
        _ => return None,
    })
}

fn date_symbol(c: char) -> Option<u8> {
    Some(match c {
        '1'..='9' => c as u8 - b'0',
        '0' => 10,
        ':' => 11,
        '+' => 12,
        '-' => 13,
        'T' => 14,
        'Z' => 15,
        _ => return None,
    })
}

fn date_char(nibble: u8) -> Option<char> {
    Some(match nibble {
        1..=9 => (b'0' + nibble) as char,
        10 => '0',
        11 => ':',
        12 => '+',
        13 => '-',
        14 => 'T',
        15 => 'Z',
        _ => return None,
    })
}

fn pack(lex: &str, symbol: impl Fn(char) -> Option<u8>) -> Option<Vec<u8>> {
    if lex.chars().count() > MAX_SYMBOLS {
        return None;
    }
    let mut nibbles = Vec::with_capacity(lex.len());
    for c in lex.chars() {
        nibbles.push(symbol(c)?);
    }
    // An odd symbol count leaves the final byte's high nibble as 0, which
    // doubles as the NUL terminator on decode; an even, full 30-symbol
    // string has no terminator and decode instead stops at end-of-buffer.
    let mut out = Vec::with_capacity(nibbles.len().div_ceil(2));
    for pair in nibbles.chunks(2) {
        let lo = pair[0];
        let hi = pair.get(1).copied().unwrap_or(0);
        out.push(lo | (hi << 4));
    }
    Some(out)
}

fn unpack(bytes: &[u8], symbol: impl Fn(u8) -> Option<char>) -> Result<String> {
    let mut out = String::with_capacity(bytes.len() * 2);
    'outer: for &byte in bytes {
        for nibble in [byte & 0x0f, byte >> 4] {
            if nibble == 0 {
                break 'outer;
            }
            match symbol(nibble) {
                Some(c) => out.push(c),
                None => return Err(Error::Codec(format!("bad BCD nibble {nibble}"))),
            }
        }
    }
    Ok(out)
}

/// Packs `lex` into BCD numeric form, two symbols per byte. Returns
/// `None` (not an error) on any character outside the numeric alphabet,
/// so callers fall through to the next disposition.
pub fn compress_bcd(lex: &str) -> Option<Vec<u8>> {
    pack(lex, numeric_symbol)
}

pub fn decompress_bcd(bytes: &[u8]) -> Result<String> {
    unpack(bytes, numeric_char)
}

/// Packs `lex` into BCD xsd:dateTime form.
pub fn compress_bcdate(lex: &str) -> Option<Vec<u8>> {
    pack(lex, date_symbol)
}

pub fn decompress_bcdate(bytes: &[u8]) -> Result<String> {
    unpack(bytes, date_char)
}

/// Deflates `data`. The scratch-buffer sizing hint from spec.md 4.5
/// (`max(1024, 1.01*len + 12)`) is implicit in `flate2`'s own growable
/// output `Vec`; there is no fixed scratch buffer to preallocate here.
pub fn zlib_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut enc = ZlibEncoder::new(Vec::with_capacity(data.len().max(1024) / 2), Compression::default());
    enc.write_all(data).map_err(Error::Io)?;
    enc.finish().map_err(Error::Io)
}

pub fn zlib_decompress(data: &[u8], uncompressed_len: usize) -> Result<Vec<u8>> {
    let mut dec = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(uncompressed_len);
    dec.read_to_end(&mut out).map_err(Error::Io)?;
    Ok(out)
}
