//! A serialized key-value store used to hand challenge material to the DNS
//! and HTTP responders. All reads and writes are marshalled through a single
//! worker thread via channels, so the underlying map never needs a lock -
//! the same actor-plus-channel pattern the original client used for its Go
//! goroutines, expressed with `std::sync::mpsc`.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::thread;

use crate::error::{Error, Result};

/// Fired once, the first time a key that was just `set` is successfully read
/// back. A state machine waiting on this should treat a disconnected channel
/// the same as a fired tripwire that arrived before it started waiting - both
/// mean "the value is in the clear, move on".
pub struct Tripwire(Receiver<()>);

impl Tripwire {
    /// Blocks until the first read fires the tripwire, or until `timeout`
    /// elapses. Returns `true` if the tripwire fired (or will never fire
    /// because the entry was already read and dropped).
    pub fn wait(&self, timeout: std::time::Duration) -> bool {
        matches!(
            self.0.recv_timeout(timeout),
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected)
        )
    }
}

enum Op {
    Set {
        key: String,
        value: String,
        armed: SyncSender<()>,
        resp: Sender<()>,
    },
    Get {
        key: String,
        resp: Sender<String>,
    },
    Del {
        key: String,
        resp: Sender<()>,
    },
}

struct Entry {
    value: String,
    armed: Option<SyncSender<()>>,
}

/// A concurrency-safe map with first-read notification. `set` returns a
/// [`Tripwire`] that fires the moment some caller successfully `get`s the
/// value back out.
#[derive(Clone)]
pub struct KVStore {
    tx: Sender<Op>,
}

impl KVStore {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Op>();
        thread::spawn(move || Self::run(rx));
        KVStore { tx }
    }

    fn run(rx: Receiver<Op>) {
        let mut map: HashMap<String, Entry> = HashMap::new();

        for op in rx {
            match op {
                Op::Set {
                    key,
                    value,
                    armed,
                    resp,
                } => {
                    map.insert(
                        key,
                        Entry {
                            value,
                            armed: Some(armed),
                        },
                    );
                    let _ = resp.send(());
                }
                Op::Get { key, resp } => {
                    let value = match map.get_mut(&key) {
                        Some(entry) => {
                            if let Some(armed) = entry.armed.take() {
                                // Non-blocking: if nothing is waiting, the
                                // signal is simply dropped.
                                let _ = armed.try_send(());
                            }
                            entry.value.clone()
                        }
                        None => String::new(),
                    };
                    let _ = resp.send(value);
                }
                Op::Del { key, resp } => {
                    map.remove(&key);
                    let _ = resp.send(());
                }
            }
        }
    }

    /// Sets `key` to `value`, returning a tripwire that fires on the first
    /// subsequent `get` of this key that observes it.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Result<Tripwire> {
        let (armed_tx, armed_rx) = mpsc::sync_channel(1);
        let (resp_tx, resp_rx) = mpsc::channel();

        self.tx
            .send(Op::Set {
                key: key.into(),
                value: value.into(),
                armed: armed_tx,
                resp: resp_tx,
            })
            .map_err(|_| Error::StoreClosed)?;
        resp_rx.recv().map_err(|_| Error::StoreClosed)?;

        Ok(Tripwire(armed_rx))
    }

    pub fn get(&self, key: impl Into<String>) -> Result<String> {
        let (resp_tx, resp_rx) = mpsc::channel();
        self.tx
            .send(Op::Get {
                key: key.into(),
                resp: resp_tx,
            })
            .map_err(|_| Error::StoreClosed)?;
        resp_rx.recv().map_err(|_| Error::StoreClosed)
    }

    pub fn del(&self, key: impl Into<String>) -> Result<()> {
        let (resp_tx, resp_rx) = mpsc::channel();
        self.tx
            .send(Op::Del {
                key: key.into(),
                resp: resp_tx,
            })
            .map_err(|_| Error::StoreClosed)?;
        resp_rx.recv().map_err(|_| Error::StoreClosed)
    }
}

impl Default for KVStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn get_missing_key_is_empty() {
        let store = KVStore::new();
        assert_eq!(store.get("nope").unwrap(), "");
    }

    #[test]
    fn set_then_get_round_trips_and_fires_tripwire_once() {
        let store = KVStore::new();
        let tripwire = store.set("token", "value").unwrap();

        assert_eq!(store.get("token").unwrap(), "value");
        assert!(tripwire.wait(Duration::from_secs(1)));

        // Second read does not re-signal; the sender side was already
        // consumed by the first get, so this just exercises that further
        // reads keep returning the value.
        assert_eq!(store.get("token").unwrap(), "value");
    }

    #[test]
    fn del_removes_entry() {
        let store = KVStore::new();
        store.set("k", "v").unwrap();
        store.del("k").unwrap();
        assert_eq!(store.get("k").unwrap(), "");
    }

    #[test]
    fn tripwire_not_fired_before_first_read_times_out() {
        let store = KVStore::new();
        let tripwire = store.set("k", "v").unwrap();
        assert!(!tripwire.wait(Duration::from_millis(50)));
    }
}
