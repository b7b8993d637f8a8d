#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub(crate) use unix::{fd, selector, signal};
