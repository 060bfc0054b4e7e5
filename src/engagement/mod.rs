// Engagement: per-post scores, daily rollups, and interaction rankings.

pub mod interactions;
pub mod rollup;
pub mod score;
