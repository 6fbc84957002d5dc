//! Human-readable durations as used in `BackupPolicy` resources, like `30s`, `5m` or `1h30m`.

mod duration;
mod jiff_impl;
mod serde_impl;

pub use duration::*;
