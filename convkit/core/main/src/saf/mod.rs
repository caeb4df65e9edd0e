//! Facade re-exports for convkit-core

pub use crate::api::desc::*;
pub use crate::api::error::*;
pub use crate::api::types::*;
pub use crate::core::blocking::{BlockingPlan, Tiling};
pub use crate::core::reorder::{
    pad_blocked_spatial, reorder_act_from_blocked, reorder_act_to_blocked,
    reorder_weights_to_blocked,
};
pub use crate::core::runtime::RuntimeConfig;
pub use crate::core::view::TensorView;
