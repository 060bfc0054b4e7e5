// Pipelines: the daily collection cycle and re-derivation of stored state.

pub mod collect;
pub mod reconcile;
pub mod retry;
