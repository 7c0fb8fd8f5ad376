//! Render-settings key constants.
//!
//! Keys in a job's `render_settings` map are property paths relative to the
//! renderer's scene object; the worker applies each pair as a scripted
//! attribute write before rendering. The manager's decomposer injects the
//! border keys when splitting a tiled render.

pub const SAMPLES: &str = "cycles.samples";
pub const RESOLUTION_X: &str = "render.resolution_x";
pub const RESOLUTION_Y: &str = "render.resolution_y";
pub const RESOLUTION_PERCENTAGE: &str = "render.resolution_percentage";

pub const USE_BORDER: &str = "render.use_border";
pub const CROP_TO_BORDER: &str = "render.use_crop_to_border";
pub const BORDER_MIN_X: &str = "render.border_min_x";
pub const BORDER_MAX_X: &str = "render.border_max_x";
pub const BORDER_MIN_Y: &str = "render.border_min_y";
pub const BORDER_MAX_Y: &str = "render.border_max_y";
