//! Pinenut is a high-throughput, on-device structured logging engine.
//!
//! Records accepted on any thread are encoded, streaming-compressed and
//! optionally encrypted on the caller path, staged in a double-buffered
//! (optionally memory-mapped, crash-recoverable) region, and drained by a
//! background worker into time-bucketed segment files. The inverse read
//! path extracts time ranges byte-for-byte and parses archives back into
//! text.
//!
//! ```no_run
//! use pinenut::{Config, Domain, Level, Logger, Record};
//!
//! let domain = Domain::new("app", "/var/log/myapp");
//! let mut logger = Logger::new(domain, Config::default())?;
//! logger.log(&Record::new(Level::Info, "hello"))?;
//! logger.flush()?;
//! logger.shutdown()?;
//! # Ok::<(), pinenut::Error>(())
//! ```

mod buffer;
mod cipher;
mod clock;
mod codec;
mod compress;
mod error;
mod logger;
mod parse;
mod record;
mod segment;

pub use self::cipher::KeyPair;
pub use self::clock::{thread_id, Clock, SystemClock, Timestamp};
pub use self::error::{Error, Result};
pub use self::logger::{Config, Domain, Logger};
pub use self::parse::{extract, parse_to_file, DefaultFormatter, Formatter};
pub use self::record::{Level, Location, Record};
pub use self::segment::Rotation;
