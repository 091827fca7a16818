//! A self-healing append-only record log, mirrored across a primary file
//! and a `.bak` backup.
//!
//! Records are framed with a CRC32 chain linking each frame to its
//! predecessor; reads walk the log tail-to-head. On any corruption
//! (truncation at either end, byte mutations mid-file, or the outright
//! loss of one copy), the repair engine reconciles primary and backup by
//! splicing the longest validated prefix from one with the longest
//! validated suffix from the other.
//!
//! ```no_run
//! use chainlog::Log;
//!
//! let mut log = Log::new("events.log");
//! log.write(b"hello").unwrap();
//! log.force_commit().unwrap();
//! assert_eq!(log.read().unwrap(), Some(b"hello".to_vec()));
//! ```

pub mod error;
pub mod frame;
pub mod frame_chain;
pub mod log;
pub mod repair;
pub mod reverse_reader;

pub use error::{GianError, Result};
pub use log::Log;
