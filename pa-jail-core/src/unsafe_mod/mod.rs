//! Raw primitives that cannot be expressed through `nix`'s safe wrappers:
//! the namespace clone, the async-signal-safe self-pipe plumbing, and
//! password-database enumeration.

pub mod passwd;
pub mod process;
pub mod signal;
