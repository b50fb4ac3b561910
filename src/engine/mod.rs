//! Pluggable collaborators and the chef builder

pub mod builder;
pub mod stubs;
pub mod traits;

pub use builder::ChefBuilder;
