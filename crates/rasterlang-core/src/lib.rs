pub mod error;
pub mod expr;
pub mod function;
pub mod mutate;
pub mod names;
pub mod ops;
pub mod qualify;
pub mod schedule;
pub mod scope;
pub mod stmt;
pub mod substitute;
pub mod target;
pub mod types;
pub mod visit;

// Re-export commonly used types
pub use error::CoreError;
pub use expr::{
    intrinsic, BinaryOp, CallKind, CmpOp, Expr, ExprKind, ModulusRemainder, ReduceOp,
    VarBinding,
};
pub use function::{
    build_environment, call_func, direct_callees, Definition, Environment, ExternArgument,
    ExternDefinition, Function, Specialization,
};
pub use mutate::Mutator;
pub use names::unique_name;
pub use qualify::qualify;
pub use schedule::{
    var_name_match, BoundDirective, Dim, DimType, FuncSchedule, FuseLoopLevel, FusedPair,
    LoopAlignStrategy, LoopLevel, ReductionVariable, Split, SplitKind, StageSchedule,
    StorageDim, TailStrategy,
};
pub use scope::Scope;
pub use stmt::{
    DeviceApi, ForType, MemoryType, PrefetchDirective, Range, Stmt, StmtKind,
};
pub use substitute::{
    expr_uses_var, stmt_uses_var, substitute, substitute_expr, substitute_expr_stmt,
    substitute_map, substitute_map_stmt, substitute_stmt,
};
pub use target::{Arch, Feature, Os, Target};
pub use types::{Type, TypeCode};
pub use visit::Visitor;
