pub mod flow;
pub mod media;
pub mod webhook;
