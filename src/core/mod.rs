// Core modules implementing pooling, script execution, value marshaling, and error modeling.
pub mod error;
pub mod interpreter;
pub mod module;
pub mod package;
pub mod pool;
pub mod value;
