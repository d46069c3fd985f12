pub mod mirror;

pub use mirror::{MirrorConfig, MirrorEngine, MirrorError};
