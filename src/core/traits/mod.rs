pub mod executor;
pub mod sandbox;
