pub mod domain;
pub mod logic;
pub mod transport;
#[cfg(test)]
pub mod testing;
