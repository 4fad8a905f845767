//! The replicated key-value map and its command applier.
//!
//! The map mutates only here, driven by the apply loop in strict log-index
//! order. Commands are the clients' original RESP requests:
//!
//! - `SET key value…` stores the value tokens joined by single spaces
//! - `DEL key…` removes each listed key and records how many existed,
//!   keyed by log index, for the leader's client path to pick up
//! - `GET key` and anything unrecognised mutate nothing
//!
//! Application is idempotent, which is what makes the restart story sound:
//! the log replays from index 1 into a fresh map.

use crate::resp;
use bytes::Bytes;
use maru_raft::{LogIndex, StateMachine};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// Retain at most this many DEL results; old ones are for requests that
/// long since timed out.
const DEL_RESULT_CAP: usize = 1024;

#[derive(Default)]
pub struct KvStore {
    map: Mutex<HashMap<String, String>>,
    /// DEL pre-removal counts by log index, consumed by the client path.
    del_counts: Mutex<BTreeMap<LogIndex, i64>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.map.lock().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map.lock().insert(key.to_string(), value.to_string());
    }

    /// Remove `key`, reporting whether it was present.
    pub fn del(&self, key: &str) -> bool {
        self.map.lock().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    /// Take the recorded DEL count for the entry applied at `index`.
    pub fn take_del_count(&self, index: LogIndex) -> Option<i64> {
        self.del_counts.lock().remove(&index)
    }

    fn record_del_count(&self, index: LogIndex, count: i64) {
        let mut del_counts = self.del_counts.lock();
        del_counts.insert(index, count);
        while del_counts.len() > DEL_RESULT_CAP {
            del_counts.pop_first();
        }
    }
}

impl StateMachine for KvStore {
    fn apply(&self, index: LogIndex, command: &Bytes) -> maru_raft::Result<()> {
        let Ok(text) = std::str::from_utf8(command) else {
            tracing::warn!(%index, "skipping non-UTF-8 log entry");
            return Ok(());
        };
        let args = match resp::parse_command(text) {
            Ok(Some((args, _))) => args,
            _ => {
                tracing::warn!(%index, "skipping unparsable log entry");
                return Ok(());
            }
        };
        if args.is_empty() {
            return Ok(());
        }

        match args[0].to_uppercase().as_str() {
            "SET" if args.len() >= 3 => {
                let value = args[2..].join(" ");
                self.set(&args[1], &value);
            }
            "DEL" if args.len() >= 2 => {
                let mut count = 0;
                for key in &args[1..] {
                    if self.del(key) {
                        count += 1;
                    }
                }
                self.record_del_count(index, count);
            }
            // GET reads nothing here; it is logged only so every command
            // flows through the same pipeline.
            _ => {}
        }
        Ok(())
    }
}
