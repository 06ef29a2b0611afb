pub mod account;
pub mod errors;
pub mod market;
pub mod orders;
pub mod policy;

pub use account::*;
pub use errors::*;
pub use market::*;
pub use orders::*;
pub use policy::*;
