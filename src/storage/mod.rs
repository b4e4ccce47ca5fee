mod log_cache;
mod meta;
mod wal;

pub(crate) use log_cache::*;
#[doc(hidden)]
pub use meta::*;
#[doc(hidden)]
pub use wal::*;
