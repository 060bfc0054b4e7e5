// Relation tracking: snapshot diffs and removal classification.

pub mod classifier;
pub mod differ;

pub use classifier::classify;
pub use differ::diff;
