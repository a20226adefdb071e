// Snapshot stores, map rendering and dataset export

pub mod directory;
pub mod export;
pub mod git;
pub mod svg;

pub use directory::DirectoryStore;
pub use export::{export, ExportError, ExportFormat};
pub use git::GitStore;
pub use svg::{render_range, render_svg, Bounds, ColorScale, Gradient, MapStyle, RenderError, Rgb};
