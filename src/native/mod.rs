/// Native module contains the OS-level implementation of the sandbox,
/// using rlimits, namespaces and `/proc` directly instead of an external
/// container runtime.
pub mod jail;
pub mod limits;
pub mod monitor;
pub mod sandbox;
pub mod workspace;
