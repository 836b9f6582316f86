/// Storage backends: the document store the core talks to.
///
/// Anything that can read/write by key, compare-and-swap, hand out
/// monotonic ids, scan a prefix in key order and publish changes can host
/// the engine.
pub mod memory;
pub mod sled_backend;

pub use memory::MemoryBackend;
pub use sled_backend::SledBackend;

use crate::error::Result;
use tokio::sync::broadcast;

/// Capacity of each backend's change channel
pub const WATCH_CAPACITY: usize = 1024;

/// A committed write; `value` is `None` for removals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

/// Outcome of a compare-and-swap: `Err` carries the value actually stored
pub type CasResult = std::result::Result<(), Option<Vec<u8>>>;

/// Makes the `(key, value)` of an appended entry from its id and the
/// previous last entry under the prefix
pub type AppendBuilder<'a> = dyn FnMut(u64, Option<&[u8]>) -> Result<(String, Vec<u8>)> + 'a;

pub trait Backend: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write `value` durably before returning
    fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Store `new` only if the current value equals `expected`
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
    ) -> Result<CasResult>;

    /// Strictly increasing id, unique for the lifetime of the store.
    /// Never returns an id below one still being written by `append`.
    fn next_id(&self) -> Result<u64>;

    /// Allocate the next id and write the entry `build` makes for it in one
    /// step. `build` also gets the current last entry under `prefix`.
    /// Appends on one backend commit and publish in id order.
    fn append(&self, prefix: &str, build: &mut AppendBuilder<'_>) -> Result<u64>;

    /// Entries under `prefix` in key order, starting strictly after `after`
    fn scan(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Vec<u8>)>>;

    /// The last `n` entries under `prefix`, in key order
    fn scan_last(&self, prefix: &str, n: usize) -> Result<Vec<(String, Vec<u8>)>>;

    /// Stream of every change committed after this call
    fn watch(&self) -> Result<broadcast::Receiver<Change>>;
}

/// Read and decode a JSON record
pub(crate) fn get_json<T: serde::de::DeserializeOwned>(
    backend: &dyn Backend,
    key: &str,
) -> Result<Option<T>> {
    match backend.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON record
pub(crate) fn put_json<T: serde::Serialize>(
    backend: &dyn Backend,
    key: &str,
    value: &T,
) -> Result<()> {
    let raw = serde_json::to_vec(value)?;
    backend.put(key, raw)
}
