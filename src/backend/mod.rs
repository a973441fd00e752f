pub mod domain;
pub mod logic;

#[cfg(test)]
pub mod testing;
