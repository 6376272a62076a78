//! The six built-in stages, in execution order.

pub mod normalize;
pub mod sanitize;
pub mod rerank;
pub mod allocate;
pub mod compress;
pub mod assemble;

pub use allocate::AllocateStage;
pub use assemble::AssembleStage;
pub use compress::CompressStage;
pub use normalize::NormalizeStage;
pub use rerank::RerankStage;
pub use sanitize::SanitizeStage;
