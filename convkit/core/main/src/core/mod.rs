pub mod blocking;
pub mod reorder;
pub mod runtime;
pub mod view;
