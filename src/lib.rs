#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("shroud only supports x86-64 Linux");

pub mod alloc;
pub mod cipher;
pub mod code;
pub mod decode;
pub mod dispatch;
pub mod error;
pub mod marker;
mod obfuscate;
mod overwrite;
pub mod registry;
pub mod relocate;

pub use cipher::CipherConfig;
pub use error::ShroudError;
pub use obfuscate::{obfuscate_function, obfuscate_function_with, ObfuscateOptions};
