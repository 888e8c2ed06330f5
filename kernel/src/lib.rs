#![cfg_attr(target_os = "none", no_std)]

pub mod block;
pub mod sync;
pub mod vm;

extern crate alloc;
