mod slab;

pub(crate) use slab::{Handle, Slab};
