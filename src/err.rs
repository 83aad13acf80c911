//! Common error codes.
//!
//! Codes cover the POSIX-ish surface this subsystem exposes: invalid
//! arguments, bad addresses, policy denials, and resource exhaustion.
pub type ErrorCode = u16;

pub const E_OK: u16 = 0;
pub const E_NOT_IMPLEMENTED: u16 = 5;
pub const E_INVALID_ARGUMENT: u16 = 8;
pub const E_OUT_OF_MEMORY: u16 = 9;
pub const E_NOT_ALLOWED: u16 = 10; // PERMISSION ERROR.
pub const E_NOT_FOUND: u16 = 11;
pub const E_BAD_HANDLE: u16 = 18;
pub const E_BAD_ADDRESS: u16 = 19;
pub const E_ACCESS_DENIED: u16 = 20;
pub const E_NO_DEVICE: u16 = 21;

pub const E_MAX: u16 = u16::MAX;
