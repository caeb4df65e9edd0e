pub mod engine;
pub mod gemm;
pub mod scheduler;
pub mod scratch;
pub mod weights;
pub mod winograd;
