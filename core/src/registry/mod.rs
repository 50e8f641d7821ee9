// Registries loaded once at startup: topics, layout, routes
mod layout;
mod topics;

pub use layout::{
    FixedPosition, GridPosition, Intersection, IntersectionAction, Layout, LayoutModule, Road,
    RouteCatalog, RouteDef,
};
pub use topics::{Category, Direction, RegistryWatcher, SharedRegistry, TopicInfo, TopicRegistry};
