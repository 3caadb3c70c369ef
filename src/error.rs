//! Crate-wide error glue.
//!
//! Each component defines its own error enum close to where it is used
//! (`ConfigError` in [`crate::config`], `SensorError`/`TransportError` in
//! [`crate::sensor`], `StorageError` in [`crate::storage`], `HttpError` in
//! [`crate::http`]). This module only provides the top-level alias used by
//! the daemon binary's `main`, which is the one place allowed to collapse
//! every component error into a single opaque type.

pub type DaemonResult<T> = anyhow::Result<T>;

