//! # Architecture-Specific HAL Modules
//!
//! Only x86_64 is implemented; other targets build without paging
//! control and rely on host-side collaborators.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
