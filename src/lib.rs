#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod err;
pub mod mm;
pub mod uspace;
pub mod util;

pub use err::ErrorCode;
