pub mod bounds_binding;
pub mod error;
pub mod flatten;
pub mod image_checks;
pub mod inject;
pub mod inline;
pub mod loop_nest;
pub mod lower;
pub mod remove_undef;
pub mod skip_stages;
pub mod storage_folding;
pub mod vectorize;

// Re-export commonly used types
pub use bounds_binding::bind_bounds;
pub use error::LowerError;
pub use flatten::storage_flattening;
pub use image_checks::{add_image_checks, BufferConstraints};
pub use inject::{remove_loops_over_outermost, schedule_functions};
pub use inline::inline_function;
pub use loop_nest::{build_extern_produce, build_loop_nest, build_provide_loop_nest};
pub use lower::{lower, LoweredPipeline};
pub use remove_undef::remove_undef;
pub use skip_stages::skip_stages;
pub use storage_folding::storage_folding;
pub use vectorize::vectorize_loops;
