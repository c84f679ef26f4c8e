pub mod archive;
pub mod bt;
pub mod http;
pub mod registry;
