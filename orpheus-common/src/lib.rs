pub mod interface;
pub mod status;
pub mod utils;

pub use interface::*;
pub use status::*;
