//! Core grid primitives.
//!
//! Pure value types shared by the map engine and the network layer.

pub mod point;
pub mod rect;

// Re-export core types
pub use point::Point;
pub use rect::Rect;
