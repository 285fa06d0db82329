pub mod driver;
pub mod ftl;
pub mod image;
