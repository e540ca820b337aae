//! The two sub-pipelines sharing item state.

pub mod generate;
pub mod publish;

pub use generate::run_generate;
pub use publish::run_publish;
