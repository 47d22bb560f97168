pub mod asset;
pub mod request;
pub mod result;

pub use asset::*;
pub use request::*;
pub use result::*;
