pub mod compare;
pub mod domain;
pub mod errors;
pub mod pipeline;
pub mod traits;
