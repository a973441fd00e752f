pub mod expression;
pub mod logic;
