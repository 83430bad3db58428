pub mod env;
pub mod resources;
