pub mod bounds;
pub mod monotonic;
pub mod order;
pub mod simplify;

// Re-export commonly used types
pub use bounds::{
    bounds_of_expr_in_scope, box_provided, box_required, boxes_touched, region_contains,
    region_union, AccessKind, Interval, Region,
};
pub use monotonic::{is_monotonic, Monotonic};
pub use order::{realization_order, OrderError};
pub use simplify::{
    as_const_float, as_const_int_deep, can_prove, find_constant_upper_bound, is_const_false,
    is_const_one, is_const_true, is_const_zero, is_negative_const, is_positive_const,
    simplify, simplify_stmt,
};
