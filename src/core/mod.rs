pub mod classifier;
pub mod features;
pub mod grouping;
pub mod image;
pub mod matcher;
pub mod ocr;
