pub mod denc;
pub mod error;
pub mod object_info;
pub mod types;

pub use denc::*;
pub use error::*;
pub use object_info::*;
pub use types::*;
