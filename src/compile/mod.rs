//! Compilation: lowering parsed pages into executable programs, the
//! on-demand loader cache, and the compile-error surrogate.

pub mod generate;
pub mod loader;
mod program;
pub mod surrogate;

pub use generate::{class_name_for, normalize_path};
pub use loader::{LoadedPage, Loader};
pub use program::*;
pub use surrogate::CompileFailure;
