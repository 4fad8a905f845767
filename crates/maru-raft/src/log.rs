//! Persistent replicated log store with a commit pointer.
//!
//! The log is an ordered sequence of `(term, command)` entries starting at
//! index 1; index 0 is a sentinel with term 0 and an empty command. All
//! operations serialize under one lock, and every mutation rewrites the
//! per-node log file before returning, so an acknowledged append survives a
//! crash.
//!
//! The store also owns the node's hard state: `current_term` and
//! `voted_for` persist to a sibling file and must hit disk before the vote
//! or candidacy they record becomes visible on the wire.
//!
//! # File format
//!
//! One human-readable record per entry:
//!
//! ```text
//! index: 3\tterm: 2
//! entry: SET a 1
//! -------------------------------------
//! ```
//!
//! Entry bytes are escaped (`\\`, `\r`, `\n`, `\xNN` for other
//! non-printables) so RESP payloads survive the line-oriented replay. The
//! commit pointer is not persisted; a restarted node re-learns it from the
//! leader and re-applies from index 1.

use crate::error::{RaftError, Result};
use crate::types::{LogEntry, LogIndex, NodeId, Term};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

const RECORD_SEPARATOR: &str = "-------------------------------------";

struct LogInner {
    /// Entry payloads; `entries[0]` is the index-0 sentinel.
    entries: Vec<Bytes>,

    /// Entry terms, parallel to `entries`.
    terms: Vec<Term>,

    /// Highest committed index; never decreases.
    committed: LogIndex,
}

/// Crash-safe log store. Cheap to clone behind an `Arc` by the caller.
pub struct RaftLog {
    path: PathBuf,
    hard_path: PathBuf,
    inner: Mutex<LogInner>,
}

impl RaftLog {
    /// Open the log at `path`, replaying any existing file. The hard-state
    /// file lives next to it with a `.meta` extension.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let hard_path = path.with_extension("meta");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut entries = vec![Bytes::new()];
        let mut terms = vec![Term::ZERO];

        if path.exists() {
            let content = fs::read_to_string(&path)?;
            replay(&content, &mut entries, &mut terms)?;
        }

        Ok(Self {
            path,
            hard_path,
            inner: Mutex::new(LogInner {
                entries,
                terms,
                committed: LogIndex::ZERO,
            }),
        })
    }

    /// Append an entry at `last_index + 1`, persisting before returning.
    pub fn append(&self, data: Bytes, term: Term) -> Result<LogIndex> {
        let mut inner = self.inner.lock();
        inner.entries.push(data);
        inner.terms.push(term);
        self.write_to_file(&inner)?;
        Ok(LogIndex(inner.entries.len() as u32 - 1))
    }

    /// Index of the last entry; 0 if the log is empty.
    pub fn last_index(&self) -> LogIndex {
        let inner = self.inner.lock();
        LogIndex(inner.entries.len() as u32 - 1)
    }

    /// Term of the last entry; 0 if the log is empty.
    pub fn last_term(&self) -> Term {
        let inner = self.inner.lock();
        *inner.terms.last().unwrap_or(&Term::ZERO)
    }

    /// Entry payload at `index`; empty for out-of-range indexes.
    pub fn entry_at(&self, index: LogIndex) -> Bytes {
        let inner = self.inner.lock();
        let i = index.0 as usize;
        if i == 0 || i >= inner.entries.len() {
            return Bytes::new();
        }
        inner.entries[i].clone()
    }

    /// Term at `index`; 0 for out-of-range indexes.
    pub fn term_at(&self, index: LogIndex) -> Term {
        let inner = self.inner.lock();
        let i = index.0 as usize;
        if i >= inner.terms.len() {
            return Term::ZERO;
        }
        inner.terms[i]
    }

    /// Full entry at `index`, when present.
    pub fn get(&self, index: LogIndex) -> Option<LogEntry> {
        let inner = self.inner.lock();
        let i = index.0 as usize;
        if i == 0 || i >= inner.entries.len() {
            return None;
        }
        Some(LogEntry {
            term: inner.terms[i],
            data: inner.entries[i].clone(),
        })
    }

    /// Remove entries in `[from, to]`. Committed entries are untouchable;
    /// asking to truncate them is an invariant violation.
    pub fn truncate(&self, from: LogIndex, to: LogIndex) -> Result<()> {
        let mut inner = self.inner.lock();
        let last = inner.entries.len() as u32 - 1;

        if from.0 == 0 || from > to || from.0 > last {
            return Ok(());
        }
        if from <= inner.committed {
            return Err(RaftError::Internal {
                reason: format!(
                    "refusing to truncate {from}..={to}: committed through {}",
                    inner.committed
                ),
            });
        }

        let end = to.0.min(last) as usize;
        inner.entries.drain(from.0 as usize..=end);
        inner.terms.drain(from.0 as usize..=end);
        self.write_to_file(&inner)?;
        Ok(())
    }

    /// Advance the commit pointer; monotone, clamped to the last index.
    pub fn commit(&self, index: LogIndex) {
        let mut inner = self.inner.lock();
        let last = LogIndex(inner.entries.len() as u32 - 1);
        if index > inner.committed && index <= last {
            inner.committed = index;
        }
    }

    /// Highest committed index.
    pub fn committed_index(&self) -> LogIndex {
        self.inner.lock().committed
    }

    /// Load persisted `(current_term, voted_for)`; zeros when the node has
    /// no hard state yet.
    pub fn load_hard_state(&self) -> Result<(Term, NodeId)> {
        if !self.hard_path.exists() {
            return Ok((Term::ZERO, NodeId::UNKNOWN));
        }

        let content = fs::read_to_string(&self.hard_path)?;
        let mut term = None;
        let mut voted_for = None;
        for line in content.lines() {
            if let Some(value) = line.strip_prefix("term: ") {
                term = value.trim().parse::<u32>().ok();
            } else if let Some(value) = line.strip_prefix("voted_for: ") {
                voted_for = value.trim().parse::<u32>().ok();
            }
        }

        match (term, voted_for) {
            (Some(t), Some(v)) => Ok((Term(t), NodeId(v))),
            _ => Err(RaftError::Corrupt {
                reason: format!("unreadable hard state at {}", self.hard_path.display()),
            }),
        }
    }

    /// Persist `(current_term, voted_for)`. Must complete before the vote
    /// or candidacy it records is sent to any peer.
    pub fn save_hard_state(&self, term: Term, voted_for: NodeId) -> Result<()> {
        let mut file = fs::File::create(&self.hard_path)?;
        writeln!(file, "term: {}", term.0)?;
        writeln!(file, "voted_for: {}", voted_for.0)?;
        file.sync_all()?;
        Ok(())
    }

    fn write_to_file(&self, inner: &LogInner) -> Result<()> {
        let mut out = String::new();
        for i in 1..inner.entries.len() {
            out.push_str(&format!("index: {}\tterm: {}\n", i, inner.terms[i].0));
            out.push_str("entry: ");
            out.push_str(&escape(&inner.entries[i]));
            out.push('\n');
            out.push_str(RECORD_SEPARATOR);
            out.push('\n');
        }

        let mut file = fs::File::create(&self.path)?;
        file.write_all(out.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

fn replay(content: &str, entries: &mut Vec<Bytes>, terms: &mut Vec<Term>) -> Result<()> {
    let corrupt = |reason: String| RaftError::Corrupt { reason };

    let mut lines = content.lines().peekable();
    while let Some(header) = lines.next() {
        if header.trim().is_empty() {
            continue;
        }

        let (index_part, term_part) = header
            .split_once('\t')
            .ok_or_else(|| corrupt(format!("bad record header: {header:?}")))?;
        let index: usize = index_part
            .strip_prefix("index: ")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| corrupt(format!("bad index in header: {header:?}")))?;
        let term: u32 = term_part
            .strip_prefix("term: ")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| corrupt(format!("bad term in header: {header:?}")))?;

        if index != entries.len() {
            return Err(corrupt(format!(
                "non-sequential record: expected index {}, found {}",
                entries.len(),
                index
            )));
        }

        let entry_line = lines
            .next()
            .ok_or_else(|| corrupt(format!("record {index} missing entry line")))?;
        let escaped = entry_line
            .strip_prefix("entry: ")
            .ok_or_else(|| corrupt(format!("record {index} has bad entry line")))?;

        let separator = lines
            .next()
            .ok_or_else(|| corrupt(format!("record {index} missing separator")))?;
        if separator != RECORD_SEPARATOR {
            return Err(corrupt(format!("record {index} has bad separator")));
        }

        entries.push(unescape(escaped)?);
        terms.push(Term(term));
    }

    Ok(())
}

/// Escape entry bytes into a single printable line.
fn escape(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &b in data {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\r' => out.push_str("\\r"),
            b'\n' => out.push_str("\\n"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out
}

fn unescape(escaped: &str) -> Result<Bytes> {
    let corrupt = || RaftError::Corrupt {
        reason: format!("bad escape sequence in entry: {escaped:?}"),
    };

    let mut out = Vec::with_capacity(escaped.len());
    let mut chars = escaped.bytes();
    while let Some(b) = chars.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match chars.next().ok_or_else(corrupt)? {
            b'\\' => out.push(b'\\'),
            b'r' => out.push(b'\r'),
            b'n' => out.push(b'\n'),
            b'x' => {
                let hi = chars.next().ok_or_else(corrupt)?;
                let lo = chars.next().ok_or_else(corrupt)?;
                let hex = [hi, lo];
                let hex = std::str::from_utf8(&hex).map_err(|_| corrupt())?;
                out.push(u8::from_str_radix(hex, 16).map_err(|_| corrupt())?);
            }
            _ => return Err(corrupt()),
        }
    }
    Ok(Bytes::from(out))
}
