//! Loader for line-oriented octal listings.
//!
//! Two record kinds, all fields octal:
//!
//! ```text
//! i <iaddr> <lind> <lopcode> <laddr> <rind> <ropcode> <raddr>
//! d <daddr> <d3> <d2> <d1> <d0>
//! ```
//!
//! An `i` record assembles two half-instructions into one instruction
//! word. A 2-character opcode names the coarse (multiple-of-8) slot and
//! is shifted up by 3; a 3-character opcode is the 7-bit short-family
//! field, where values above 0o77 fold into the address extension. A
//! `d` record assembles four 12-bit chunks, most significant first.
//! Any other line is ignored. A malformed record is diagnosed and
//! skipped; loading continues.

use crate::bus::Bus;
use crate::cpu::decode::{emit_op, op};
use crate::word::Word;
use std::io::{BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

/// Errors that abort loading. Per-line problems only log.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Load an octal listing file into the instruction and data buses.
pub fn load_oct<P: AsRef<Path>>(path: P, ibus: &mut Bus, dbus: &mut Bus) -> Result<(), LoadError> {
    let file = std::fs::File::open(path.as_ref())?;
    load_oct_from(BufReader::new(file), ibus, dbus)
}

/// Load an octal listing from any buffered reader.
pub fn load_oct_from<R: BufRead>(
    reader: R,
    ibus: &mut Bus,
    dbus: &mut Bus,
) -> Result<(), LoadError> {
    for (num, line) in reader.lines().enumerate() {
        parse_line(&line?, num + 1, ibus, dbus);
    }
    Ok(())
}

fn parse_line(line: &str, num: usize, ibus: &mut Bus, dbus: &mut Bus) {
    let fields: Vec<&str> = line.split_whitespace().collect();
    match fields.first() {
        Some(&"i") if fields.len() == 8 => {
            let parsed = (|| {
                let iaddr = oct(fields[1])?;
                let left = parse_half(fields[2], fields[3], fields[4])?;
                let right = parse_half(fields[5], fields[6], fields[7])?;
                Some((iaddr, (left << 24) | right))
            })();
            match parsed {
                Some((iaddr, word)) => ibus.write(iaddr, word),
                None => log::warn!("oct parse error at line {}: {}", num, line),
            }
        }
        Some(&"d") if fields.len() == 6 => {
            let parsed = (|| {
                let daddr = oct(fields[1])?;
                let mut word: Word = 0;
                for chunk in &fields[2..6] {
                    word = (word << 12) | Word::from(oct(chunk)? & 0o7777);
                }
                Some((daddr, word))
            })();
            match parsed {
                Some((daddr, word)) => dbus.write(daddr, word),
                None => log::warn!("oct parse error at line {}: {}", num, line),
            }
        }
        _ => {} // not a record line
    }
}

fn oct(s: &str) -> Option<u16> {
    u16::from_str_radix(s, 8).ok()
}

/// Assemble one half-instruction from its listing fields.
fn parse_half(ind: &str, opcode: &str, addr: &str) -> Option<Word> {
    let ind = oct(ind)?;
    let mut addr = oct(addr)?;
    let op = match opcode.len() {
        2 => oct(opcode)? << 3,
        3 => {
            let mut full = oct(opcode)?;
            if full > 0o177 {
                return None;
            }
            if full > op::SHORT_MAX {
                addr |= 0o70000;
                full &= 0o77;
            }
            full
        }
        _ => return None,
    };
    emit_op(ind, op, addr).ok()
}
