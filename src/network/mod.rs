mod proxy;

#[doc(hidden)]
pub use proxy::*;
