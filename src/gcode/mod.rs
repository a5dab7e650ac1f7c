//! G-code front end: line normalization and the RS-274/NGC parser.

pub mod normalize;
pub mod parser;

pub use normalize::{normalize, verify_checksum, NormalizedBlock};
pub use parser::GcodeParser;
