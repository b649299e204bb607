pub mod assemble;
pub mod audio;
pub mod cards;
pub mod config;
pub mod pipeline;
pub mod probe;
pub mod render;
pub mod sandbox;
pub mod script;
pub mod speech;
pub mod stage_error;
pub mod timeline;
pub mod toolchain;
pub mod trim;
