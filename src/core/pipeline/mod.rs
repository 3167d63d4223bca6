pub mod running;
pub mod screening;
pub mod verdict;
