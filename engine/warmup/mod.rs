pub mod runner;
pub mod script;

pub use runner::*;
pub use script::*;
