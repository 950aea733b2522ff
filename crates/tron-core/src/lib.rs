//! Shared wire types for the tron daemon protocol: frames, payloads,
//! branded ids and the client error taxonomy.

pub mod errors;
pub mod frame;
pub mod ids;
pub mod payloads;

pub use errors::{ClientError, TimeoutKind};
pub use frame::{Frame, FrameError, FrameKind};
