pub mod application;
pub mod cli;
pub mod domain;
pub mod extraction;
pub mod storage;

pub use domain::*;
pub use storage::Repository;
