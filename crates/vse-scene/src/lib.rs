//! Scene graph for the VSE engine.
//!
//! Entities form a tree of local transforms referencing meshes and materials
//! by id. [`SceneView::build`] turns the tree into a culled draw list in a
//! deterministic order. Entities may also carry a [`Light`].

pub mod camera;
pub mod graph;
pub mod light;
pub mod view;

pub use camera::Camera;
pub use graph::{Entity, EntityId, Node, Released, SceneError, SceneGraph};
pub use light::{Light, LightKind, WorldLight};
pub use view::{DrawItem, DrawResolver, ResolvedDraw, SceneView, ViewStats};
