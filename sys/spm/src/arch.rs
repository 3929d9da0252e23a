// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, tailored for the current target.
//!
//! Each architecture support module must define the same set of names:
//!
//! - `SavedState`, implementing `thread::ArchState`
//! - `init_thread_context` and `enter_function`, which prepare a saved
//!   register file to start executing somewhere new
//! - `set_current_save`, which tells the exception return path whose
//!   registers to restore
//! - `pend_context_switch`
//! - `reset`

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "arm", target_os = "none"))] {
        #[macro_use]
        pub mod arm_m;
        pub use arm_m::*;
    } else {
        #[macro_use]
        pub mod host;
        pub use host::*;
    }
}
