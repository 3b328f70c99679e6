//! Non-blocking socket plumbing: the socket factory and the frame codec.

pub mod frame;
pub mod socket;
