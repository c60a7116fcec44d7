pub mod errors;
pub mod features;
pub mod params;

pub use errors::*;
pub use features::*;
pub use params::*;
