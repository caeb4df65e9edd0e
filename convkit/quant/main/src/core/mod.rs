pub mod requant;
pub mod simd;
pub mod weights;
