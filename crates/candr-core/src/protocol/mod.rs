//! Command encoding: packing primitives, control-block layouts,
//! window descriptors, and sense translation. No I/O happens here.

pub mod bytes;
pub mod cdb;
pub mod sense;
pub mod window;
