// Tidemark: follower and engagement history for a Bluesky account
//
// This is the library root. Each module corresponds to one subsystem:
// storage, the diff/classify/score core, archive decoding and import, and
// the collection pipeline with its remote collaborator.

pub mod archive;
pub mod backfill;
pub mod bluesky;
pub mod config;
pub mod context;
pub mod db;
pub mod engagement;
pub mod error;
pub mod lock;
pub mod output;
pub mod pipeline;
pub mod status;
pub mod tracking;
