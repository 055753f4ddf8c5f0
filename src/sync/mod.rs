pub mod normalize;
pub mod recent;
pub mod repository;
