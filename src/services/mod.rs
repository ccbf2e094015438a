pub mod audit;
pub mod sessions;
