// Archive backfill: merge a repository export into the tracked history.

pub mod importer;
pub mod merge;

pub use importer::Importer;
