//! Component-facing error kinds (spec §7). Orchestration call sites that
//! only need to propagate upward use `anyhow::Result` instead; these enums
//! exist at the boundary of C2 and C3 where callers match on the exact
//! contract kind the spec names. C5's boundary type is `MesOutcome<T>`
//! (`src/mes.rs`), which already carries `OK`/`AuthExpired`/`NotFound`/
//! `Transient`/`Permanent` as a closed enum — there is no separate
//! `MesError` type to keep in sync with it.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("durable buffer is full")]
    Full,
    #[error("durable buffer is corrupt")]
    Corrupt,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bus busy: another writer holds the line")]
    BusBusy,
    #[error("serial port lost: {0}")]
    PortLost(String),
    #[error("read timed out")]
    Timeout,
    #[error("malformed frame: {0}")]
    ParseError(String),
}
