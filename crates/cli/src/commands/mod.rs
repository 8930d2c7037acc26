pub mod fabric;
pub mod snapshot;
