pub mod engine;
pub mod error;
pub mod events;
pub mod layout;
pub mod manifest;
pub mod model;
pub mod space;
pub mod store;
pub mod tool;
