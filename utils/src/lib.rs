//! Shared utilities for Keep.
//!
//! Currently just atomic file IO; anything here must stay free of domain
//! knowledge so every crate can depend on it.

mod atomic_write;

pub use atomic_write::{AtomicWriteOptions, atomic_write, atomic_write_with_options};
