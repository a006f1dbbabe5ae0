//! Multi-study series management for a side-by-side DICOM viewer: loaded
//! studies, which series each viewport shows, drag-and-drop between the series
//! list and the viewport grid, and viewport synchronization.

pub mod assignment;
pub mod color;
pub mod config;
pub mod dicom;
pub mod dnd;
pub mod error;
pub mod events;
pub mod filter;
pub mod layout;
pub mod model;
pub mod scan;
pub mod session;
pub mod sync;

pub use assignment::{AssignmentChange, AssignmentRegistry, SeriesSharing, ViewportAssignment};
pub use config::ViewerConfig;
pub use dnd::{DragPreview, DragToken, DropOutcome, DropZone, HoverState};
pub use error::ViewerError;
pub use events::{EventBus, EventKind, StateChange, SubscriptionId, ViewerEvent};
pub use filter::{SeriesQuery, SortKey, SortOrder};
pub use layout::ViewportLayout;
pub use model::{LoadingState, Series, SeriesListing, Study, StudyCatalog};
pub use session::ViewerSession;
pub use sync::{Camera, RenderingEngine, SyncAttribute, SyncFlags, ViewportChange, WindowLevel};
