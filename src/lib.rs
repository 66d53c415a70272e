// Library entry point
pub mod engine;
pub mod export;
pub mod render;
pub mod resolve;
pub mod rolodex;
pub mod session;
pub mod sync;
pub mod tracker;
pub mod workspace;

pub use engine::{run_export, ExportReport, ExportRequest};
pub use session::SessionOptions;
pub use workspace::WorkspaceContext;
