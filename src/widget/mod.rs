pub mod domain;
pub mod template;
pub mod descriptor;
pub mod dispatcher;
pub mod logic;
