//! Architecture-specific context switching
//!
//! Each backend provides a `SavedRegs` callee-register block,
//! `init_context` to prepare a fresh fiber stack, and the naked-asm
//! `switch_context` that transfers control between two register blocks.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::*;
    } else {
        compile_error!("weft supports x86_64 and aarch64 only");
    }
}
