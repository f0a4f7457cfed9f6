pub mod canvas;
pub mod classes;

pub use canvas::Canvas;
pub use classes::{CITYSCAPES_CLASSES, CITYSCAPES_PALETTE, ClassSet};
