pub mod error;
pub mod indicators;
pub mod traits;
pub mod types;

pub use error::*;
pub use traits::*;
pub use types::*;
