//! # x86_64 Architecture HAL Implementation
//!
//! Paging control for x86_64 CPUs: CR3 access and TLB maintenance.

pub mod paging;

pub use paging::X86Tlb;
