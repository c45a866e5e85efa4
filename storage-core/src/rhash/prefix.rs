//! URI prefix dictionary: a bounded (≤256) table of learned prefixes
//! backed by a [`List`] of 512-byte records, plus the in-memory learner
//! that proposes new prefixes from lexicals that overflow to the lex
//! file (spec.md section 4.4 "Prefix learning").
//!
//! The learner here is a frequency table over candidate prefixes, not a
//! character trie: it is simple, bounded, and easy to audit, at the cost
//! of only ever proposing prefixes that end at a `/` or `#` separator
//! rather than arbitrary common substrings. Nothing in this crate's
//! tests or callers depends on trie-exact prefix discovery.

use std::collections::HashMap;

use lockable::OpenFlags;

use crate::error::Result;
use crate::list::List;

pub const PREFIX_RECORD_WIDTH: usize = 512;
pub const MAX_PREFIXES: usize = 256;
const LEARNER_CANDIDATES_PER_FLUSH: usize = 32;
const LEARNER_FLUSH_AT: usize = 256;

fn encode(code: u32, prefix: &str) -> [u8; PREFIX_RECORD_WIDTH] {
    let mut buf = [0u8; PREFIX_RECORD_WIDTH];
    buf[0..4].copy_from_slice(&code.to_le_bytes());
    let bytes = prefix.as_bytes();
    let n = bytes.len().min(PREFIX_RECORD_WIDTH - 4 - 1);
    buf[4..4 + n].copy_from_slice(&bytes[..n]);
    buf
}

fn decode(rec: &[u8]) -> (u32, String) {
    let code = u32::from_le_bytes(rec[0..4].try_into().unwrap());
    let end = rec[4..].iter().position(|&b| b == 0).unwrap_or(rec.len() - 4);
    let prefix = String::from_utf8_lossy(&rec[4..4 + end]).into_owned();
    (code, prefix)
}

/// Candidate prefixes seen by `learn`, scored by frequency. Every call to
/// `learn` tries to extend the candidate set from the lexical's leading
/// separator-terminated segments; `propose` drains it once it grows
/// large enough to be worth registering.
#[derive(Default)]
struct Learner {
    scores: HashMap<String, u32>,
    seen: usize,
}

impl Learner {
    fn learn(&mut self, lex: &str) {
        self.seen += 1;
        for (i, c) in lex.char_indices() {
            if c == '/' || c == '#' {
                let candidate = &lex[..=i];
                if candidate.len() >= 8 {
                    *self.scores.entry(candidate.to_string()).or_insert(0) += 1;
                }
            }
        }
    }

    fn is_full(&self) -> bool {
        self.seen >= LEARNER_FLUSH_AT
    }

    fn propose(&mut self) -> Vec<(String, u32)> {
        let mut ranked: Vec<(String, u32)> = self.scores.drain().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.truncate(LEARNER_CANDIDATES_PER_FLUSH);
        self.seen = 0;
        ranked
    }
}

/// The registered prefix table (persisted) plus the in-memory learner
/// (ephemeral, rebuilt from nothing on open).
pub struct PrefixDict {
    list: List,
    strings: Vec<String>, // index i -> code i+1
    learner: Learner,
}

impl PrefixDict {
    pub fn open(path: impl AsRef<std::path::Path>, flags: OpenFlags) -> Result<Self> {
        let list = List::open(path, PREFIX_RECORD_WIDTH, flags)?;
        let mut dict = PrefixDict { list, strings: Vec::new(), learner: Learner::default() };
        dict.list.lock(lockable::LockOp::Shared)?;
        let result = dict.rebuild_r();
        dict.list.lock(lockable::LockOp::Unlock)?;
        result?;
        Ok(dict)
    }

    pub fn list_mut(&mut self) -> &mut List {
        &mut self.list
    }

    /// Rebuilds the in-memory `strings` table from the backing list.
    /// Caller must already hold a shared or exclusive lock on the list
    /// (the resource hash calls this while rebuilding with its own
    /// composite lock, spec.md 4.4 "Prefix-file coupling").
    pub fn rebuild_r(&mut self) -> Result<()> {
        self.strings.clear();
        self.list.rewind();
        let mut buf = vec![0u8; PREFIX_RECORD_WIDTH];
        while self.list.next_value(&mut buf)? {
            let (code, prefix) = decode(&buf);
            let idx = code as usize - 1;
            if self.strings.len() <= idx {
                self.strings.resize(idx + 1, String::new());
            }
            self.strings[idx] = prefix;
        }
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.strings.len()
    }

    pub fn prefix_for(&self, code: u8) -> Option<&str> {
        self.strings.get(code as usize - 1).map(|s| s.as_str())
    }

    /// Longest registered prefix that `lex` starts with.
    pub fn longest_match(&self, lex: &str) -> Option<(u8, usize)> {
        let mut best: Option<(u8, usize)> = None;
        for (i, prefix) in self.strings.iter().enumerate() {
            if !prefix.is_empty() && lex.starts_with(prefix.as_str()) {
                let len = prefix.len();
                if best.map(|(_, blen)| len > blen).unwrap_or(true) {
                    best = Some(((i + 1) as u8, len));
                }
            }
        }
        best
    }

    /// Feeds `lex` to the learner; when the learner has seen enough
    /// candidates, registers the best-scoring ones (up to the global
    /// cap) and appends them to the backing list.
    pub fn learn(&mut self, lex: &str) -> Result<()> {
        if self.strings.len() >= MAX_PREFIXES {
            return Ok(());
        }
        self.learner.learn(lex);
        if !self.learner.is_full() {
            return Ok(());
        }
        for (candidate, score) in self.learner.propose() {
            if score == 0 || self.strings.len() >= MAX_PREFIXES {
                break;
            }
            if self.strings.iter().any(|s| s == &candidate) {
                continue;
            }
            let code = (self.strings.len() + 1) as u32;
            self.list.add_r(&encode(code, &candidate))?;
            self.strings.push(candidate);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockable::LockOp;

    #[test]
    fn learns_and_registers_common_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut dict = PrefixDict::open(
            dir.path().join("prefixes.bin"),
            OpenFlags { read_write: true, create: true, truncate: true },
        )
        .unwrap();
        dict.list_mut().lock(LockOp::Exclusive).unwrap();
        for i in 0..260 {
            dict.learn(&format!("http://example.org/resource/{i}")).unwrap();
        }
        dict.list_mut().lock(LockOp::Unlock).unwrap();
        assert!(dict.count() >= 1);
        let (code, plen) = dict.longest_match("http://example.org/resource/42").unwrap();
        assert_eq!(&dict.prefix_for(code).unwrap()[..plen], "http://example.org/resource/");
    }
}
