#![doc = include_str!("../README.md")]
// No warnings
//#![deny(warnings)]
#![deny(unstable_features)]
#![deny(trivial_casts)]
#![deny(unconditional_recursion)]
#![deny(clippy::empty_loop)]
#![deny(unreachable_code)]
#![deny(unreachable_pub)]
#![deny(unreachable_patterns)]
#![deny(unused_macro_rules)]
//#![deny(unused_results)]

pub mod algo;
pub mod analysis;
pub mod error;
pub mod heap;
pub mod store;
pub mod utils;

pub use error::Error;

/// Prelude module to import everything from this crate
pub mod prelude {
    pub use crate::analysis::*;
    pub use crate::error::Error;
    pub use crate::heap::*;
    pub use crate::store::*;
    pub use crate::utils::*;
}
