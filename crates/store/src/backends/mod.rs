//! Database backend implementations.
//!
//! Each backend implements the traits of [`crate::core`] and is gated behind a
//! feature flag.
//!
//! | Backend | Feature | Description |
//! |---------|---------|-------------|
//! | SQLite | `sqlite` | Embedded database, in-memory or file based |

#[cfg(feature = "sqlite")]
pub mod sqlite;
