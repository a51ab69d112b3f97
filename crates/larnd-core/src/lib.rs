pub mod common;
pub mod domain;
pub mod fit;
pub mod modules;
pub mod pipeline;
