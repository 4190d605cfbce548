//! Statement nodes of the IR.
//!
//! Same representation discipline as [`crate::expr`]: a [`Stmt`] is an
//! `Arc` handle to an immutable [`StmtKind`], shared structurally and
//! compared either by pointer ([`Stmt::same_as`]) or deeply (`==`).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::expr::{Expr, ModulusRemainder, VarBinding};
use crate::types::Type;

/// Execution discipline of a [`For`](StmtKind::For) loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForType {
    Serial,
    Parallel,
    Vectorized,
    Unrolled,
    GpuBlock,
    GpuThread,
    /// The loop is realized by an extern stage; the body is a descriptor.
    Extern,
    /// Iterations run concurrently as forked tasks.
    Fork,
}

impl ForType {
    /// True for loop types whose iterations may run concurrently.
    pub fn is_unordered_parallel(self) -> bool {
        matches!(
            self,
            ForType::Parallel | ForType::GpuBlock | ForType::GpuThread | ForType::Fork
        )
    }
}

/// Device placement of a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceApi {
    None,
    Host,
    Cuda,
    OpenCl,
    Metal,
    Vulkan,
}

/// Where an allocation should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryType {
    Auto,
    Heap,
    Stack,
    Register,
}

/// A `min`/`extent` pair describing one dimension of a region.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Range {
    pub min: Expr,
    pub extent: Expr,
}

impl Range {
    pub fn new(min: Expr, extent: Expr) -> Range {
        Range { min, extent }
    }
}

/// Prefetch placement recorded on a [`Prefetch`](StmtKind::Prefetch) node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrefetchDirective {
    /// The buffer being prefetched.
    pub name: String,
    /// The loop variable the prefetch distance is measured along.
    pub at: String,
    /// The loop variable whose stride defines one prefetch step.
    pub from: String,
    /// How many iterations ahead to fetch.
    pub offset: Expr,
}

/// The payload of a statement node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StmtKind {
    LetStmt {
        name: String,
        value: Expr,
        body: Stmt,
    },
    /// Aborts the pipeline with `error` if `condition` is false at runtime.
    AssertStmt {
        condition: Expr,
        error: Expr,
    },
    /// Marks the production (or consumption) region of a named function.
    ProducerConsumer {
        name: String,
        is_producer: bool,
        body: Stmt,
    },
    For {
        name: String,
        min: Expr,
        extent: Expr,
        for_type: ForType,
        device_api: DeviceApi,
        body: Stmt,
    },
    /// A write of `value.lanes` elements to a flat buffer.
    Store {
        name: String,
        value: Expr,
        index: Expr,
        predicate: Expr,
        alignment: ModulusRemainder,
        binding: VarBinding,
    },
    /// A multidimensional, multi-valued store to a not-yet-flattened function.
    Provide {
        name: String,
        values: Vec<Expr>,
        args: Vec<Expr>,
        predicate: Expr,
    },
    Allocate {
        name: String,
        ty: Type,
        memory_type: MemoryType,
        extents: Vec<Expr>,
        condition: Expr,
        body: Stmt,
        /// Custom allocation expression, replacing the default allocator.
        new_expr: Option<Expr>,
        /// Custom deallocation function name.
        free_function: Option<String>,
        /// Extra elements allocated past the end.
        padding: u32,
    },
    Free {
        name: String,
    },
    /// The region within which a function's storage exists, pre-flattening.
    Realize {
        name: String,
        types: Vec<Type>,
        memory_type: MemoryType,
        bounds: Vec<Range>,
        condition: Expr,
        body: Stmt,
    },
    /// Sequential composition.
    Block {
        first: Stmt,
        rest: Stmt,
    },
    /// Concurrent composition.
    Fork {
        first: Stmt,
        rest: Stmt,
    },
    IfThenElse {
        condition: Expr,
        then_case: Stmt,
        else_case: Option<Stmt>,
    },
    Evaluate {
        value: Expr,
    },
    /// A placeholder later resolved into prefetch intrinsic calls.
    Prefetch {
        name: String,
        types: Vec<Type>,
        bounds: Vec<Range>,
        directive: PrefetchDirective,
        condition: Expr,
        body: Stmt,
    },
    /// The body runs with mutual exclusion keyed by `mutex_name`.
    Atomic {
        producer_name: String,
        mutex_name: String,
        body: Stmt,
    },
    /// The body runs after acquiring `count` units of `semaphore`.
    Acquire {
        semaphore: Expr,
        count: Expr,
        body: Stmt,
    },
}

/// A shared, immutable statement.
#[derive(Debug, Clone, Eq)]
pub struct Stmt(Arc<StmtKind>);

impl PartialEq for Stmt {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || *self.0 == *other.0
    }
}

impl std::hash::Hash for Stmt {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Stmt {
    fn new(kind: StmtKind) -> Stmt {
        Stmt(Arc::new(kind))
    }

    pub fn kind(&self) -> &StmtKind {
        &self.0
    }

    /// Pointer identity: true iff both handles refer to the same node.
    pub fn same_as(&self, other: &Stmt) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn let_stmt(name: impl Into<String>, value: Expr, body: Stmt) -> Stmt {
        Stmt::new(StmtKind::LetStmt { name: name.into(), value, body })
    }

    pub fn assert_stmt(condition: Expr, error: Expr) -> Stmt {
        assert!(condition.ty().is_bool() && condition.ty().is_scalar());
        Stmt::new(StmtKind::AssertStmt { condition, error })
    }

    pub fn producer(name: impl Into<String>, body: Stmt) -> Stmt {
        Stmt::new(StmtKind::ProducerConsumer { name: name.into(), is_producer: true, body })
    }

    pub fn consumer(name: impl Into<String>, body: Stmt) -> Stmt {
        Stmt::new(StmtKind::ProducerConsumer { name: name.into(), is_producer: false, body })
    }

    pub fn for_loop(
        name: impl Into<String>,
        min: Expr,
        extent: Expr,
        for_type: ForType,
        device_api: DeviceApi,
        body: Stmt,
    ) -> Stmt {
        assert!(min.ty().is_scalar() && extent.ty().is_scalar());
        Stmt::new(StmtKind::For { name: name.into(), min, extent, for_type, device_api, body })
    }

    /// A host-side serial loop.
    pub fn serial_for(name: impl Into<String>, min: Expr, extent: Expr, body: Stmt) -> Stmt {
        Stmt::for_loop(name, min, extent, ForType::Serial, DeviceApi::None, body)
    }

    pub fn store(
        name: impl Into<String>,
        value: Expr,
        index: Expr,
        predicate: Expr,
        alignment: ModulusRemainder,
        binding: VarBinding,
    ) -> Stmt {
        assert_eq!(value.lanes(), index.lanes(), "Store index lanes must match value");
        assert_eq!(
            value.lanes(),
            predicate.lanes(),
            "Store predicate lanes must match value"
        );
        Stmt::new(StmtKind::Store {
            name: name.into(),
            value,
            index,
            predicate,
            alignment,
            binding,
        })
    }

    pub fn provide(
        name: impl Into<String>,
        values: Vec<Expr>,
        args: Vec<Expr>,
        predicate: Expr,
    ) -> Stmt {
        assert!(!values.is_empty(), "Provide requires at least one value");
        Stmt::new(StmtKind::Provide { name: name.into(), values, args, predicate })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn allocate(
        name: impl Into<String>,
        ty: Type,
        memory_type: MemoryType,
        extents: Vec<Expr>,
        condition: Expr,
        body: Stmt,
        new_expr: Option<Expr>,
        free_function: Option<String>,
        padding: u32,
    ) -> Stmt {
        Stmt::new(StmtKind::Allocate {
            name: name.into(),
            ty,
            memory_type,
            extents,
            condition,
            body,
            new_expr,
            free_function,
            padding,
        })
    }

    pub fn free(name: impl Into<String>) -> Stmt {
        Stmt::new(StmtKind::Free { name: name.into() })
    }

    pub fn realize(
        name: impl Into<String>,
        types: Vec<Type>,
        memory_type: MemoryType,
        bounds: Vec<Range>,
        condition: Expr,
        body: Stmt,
    ) -> Stmt {
        Stmt::new(StmtKind::Realize {
            name: name.into(),
            types,
            memory_type,
            bounds,
            condition,
            body,
        })
    }

    pub fn block(first: Stmt, rest: Stmt) -> Stmt {
        Stmt::new(StmtKind::Block { first, rest })
    }

    /// Right-nested Block of all statements; `None` if the input is empty.
    pub fn block_of(stmts: Vec<Stmt>) -> Option<Stmt> {
        let mut result: Option<Stmt> = None;
        for s in stmts.into_iter().rev() {
            result = Some(match result {
                Some(rest) => Stmt::block(s, rest),
                None => s,
            });
        }
        result
    }

    pub fn fork(first: Stmt, rest: Stmt) -> Stmt {
        Stmt::new(StmtKind::Fork { first, rest })
    }

    pub fn if_then_else(condition: Expr, then_case: Stmt, else_case: Option<Stmt>) -> Stmt {
        assert!(condition.ty().is_bool());
        Stmt::new(StmtKind::IfThenElse { condition, then_case, else_case })
    }

    pub fn evaluate(value: Expr) -> Stmt {
        Stmt::new(StmtKind::Evaluate { value })
    }

    pub fn prefetch(
        name: impl Into<String>,
        types: Vec<Type>,
        bounds: Vec<Range>,
        directive: PrefetchDirective,
        condition: Expr,
        body: Stmt,
    ) -> Stmt {
        Stmt::new(StmtKind::Prefetch {
            name: name.into(),
            types,
            bounds,
            directive,
            condition,
            body,
        })
    }

    pub fn atomic(
        producer_name: impl Into<String>,
        mutex_name: impl Into<String>,
        body: Stmt,
    ) -> Stmt {
        Stmt::new(StmtKind::Atomic {
            producer_name: producer_name.into(),
            mutex_name: mutex_name.into(),
            body,
        })
    }

    pub fn acquire(semaphore: Expr, count: Expr, body: Stmt) -> Stmt {
        Stmt::new(StmtKind::Acquire { semaphore, count, body })
    }

    /// A statement with no effect.
    pub fn no_op() -> Stmt {
        Stmt::evaluate(Expr::i32(0))
    }

    /// True for statements that evaluate a constant and nothing else.
    pub fn is_no_op(&self) -> bool {
        match self.kind() {
            StmtKind::Evaluate { value } => value.is_const(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_op_roundtrip() {
        assert!(Stmt::no_op().is_no_op());
        let s = Stmt::evaluate(Expr::var_i32("x"));
        assert!(!s.is_no_op());
    }

    #[test]
    fn block_of_builds_right_nested() {
        let stmts = vec![Stmt::no_op(), Stmt::free("a"), Stmt::free("b")];
        let s = Stmt::block_of(stmts).unwrap();
        match s.kind() {
            StmtKind::Block { rest, .. } => {
                assert!(matches!(rest.kind(), StmtKind::Block { .. }));
            }
            other => panic!("expected Block, got {other:?}"),
        }
        assert!(Stmt::block_of(vec![]).is_none());
    }

    #[test]
    fn structural_equality_and_identity() {
        let a = Stmt::free("buf");
        let b = Stmt::free("buf");
        assert_eq!(a, b);
        assert!(!a.same_as(&b));
        let c = a.clone();
        assert!(a.same_as(&c));
    }

    #[test]
    #[should_panic]
    fn store_lane_mismatch_panics() {
        let v = Expr::ramp(Expr::i32(0), Expr::i32(1), 4);
        let _ = Stmt::store(
            "b",
            v,
            Expr::i32(0),
            Expr::const_true(),
            ModulusRemainder::unknown(),
            VarBinding::Free,
        );
    }
}
