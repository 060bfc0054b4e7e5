// Bluesky collaborator: the unauthenticated API surface a collection
// cycle reads from, behind the `GraphSource` trait.

pub mod client;
pub mod followers;
pub mod posts;
pub mod profiles;
pub mod source;

pub use source::{GraphSource, PublicGraphSource};
