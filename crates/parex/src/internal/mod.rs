#[macro_use]
pub(crate) mod common;
pub mod registry;
pub mod scheduler;
pub mod worker;

#[cfg(test)]
pub mod tests;
