//! Expression nodes of the IR.
//!
//! An [`Expr`] is a cheap handle (`Arc`) to an immutable [`ExprNode`]:
//! the computed [`Type`] plus an [`ExprKind`] payload. Structural sharing
//! is expected everywhere; mutators rebuild only the spine that changed
//! and [`Expr::same_as`] detects untouched subtrees by pointer identity.
//!
//! Smart constructors validate the typing invariants and perform only
//! information-preserving simplifications (e.g. a one-lane broadcast is
//! the value itself). Violations are internal errors and panic.

use std::sync::Arc;

use crate::types::{Type, TypeCode};

/// What a [`Variable`](ExprKind::Variable) or a memory access is bound to.
///
/// The binding participates in structural equality: two variables with the
/// same name but different bindings are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VarBinding {
    /// A free variable (loop vars, let-bound names, symbolic bounds).
    Free,
    /// A reduction-domain variable.
    ReductionDomain,
    /// A named buffer parameter supplied by the caller.
    Param(String),
    /// A named image literal owned by the enclosing module.
    Image(String),
}

impl VarBinding {
    pub fn is_buffer(&self) -> bool {
        matches!(self, VarBinding::Param(_) | VarBinding::Image(_))
    }
}

/// Known alignment of a memory access index: `index % modulus == remainder`.
///
/// `modulus == 1` means nothing is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModulusRemainder {
    pub modulus: i64,
    pub remainder: i64,
}

impl ModulusRemainder {
    pub fn unknown() -> ModulusRemainder {
        ModulusRemainder { modulus: 1, remainder: 0 }
    }

    /// Alignment after scaling the index by a constant factor.
    pub fn scaled(self, factor: i64) -> ModulusRemainder {
        ModulusRemainder {
            modulus: self.modulus * factor,
            remainder: self.remainder * factor,
        }
    }
}

impl Default for ModulusRemainder {
    fn default() -> Self {
        ModulusRemainder::unknown()
    }
}

/// Binary arithmetic operators. Operand types must match after widening;
/// the result has the operand type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
}

/// Comparison operators. The result is boolean with the operand lane count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Horizontal reduction operators for [`ExprKind::VectorReduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Add,
    Mul,
    Min,
    Max,
    And,
    Or,
    SaturatingAdd,
}

/// How a [`Call`](ExprKind::Call) resolves, which also determines purity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// A compiler intrinsic with side effects (or effects on control flow).
    Intrinsic,
    /// A compiler intrinsic free of side effects.
    PureIntrinsic,
    /// An external C function with side effects.
    Extern,
    /// An external C function free of side effects.
    PureExtern,
    /// A reference to another pipeline function (always pure).
    PipelineFunc,
    /// A read of an input image or buffer parameter (always pure).
    Image,
}

impl CallKind {
    pub fn is_pure(self) -> bool {
        matches!(
            self,
            CallKind::PureIntrinsic
                | CallKind::PureExtern
                | CallKind::PipelineFunc
                | CallKind::Image
        )
    }
}

/// Intrinsic names understood by the lowering core.
pub mod intrinsic {
    pub const IF_THEN_ELSE: &str = "if_then_else";
    pub const LIKELY: &str = "likely";
    pub const LIKELY_IF_INNERMOST: &str = "likely_if_innermost";
    pub const BITWISE_AND: &str = "bitwise_and";
    pub const BITWISE_OR: &str = "bitwise_or";
    pub const BITWISE_XOR: &str = "bitwise_xor";
    pub const BITWISE_NOT: &str = "bitwise_not";
    pub const SHIFT_LEFT: &str = "shift_left";
    pub const SHIFT_RIGHT: &str = "shift_right";
    pub const DIV_ROUND_TO_ZERO: &str = "div_round_to_zero";
    pub const MOD_ROUND_TO_ZERO: &str = "mod_round_to_zero";
    pub const MULHI_SHR: &str = "mulhi_shr";
    pub const SORTED_AVG: &str = "sorted_avg";
    pub const SATURATING_ADD: &str = "saturating_add";
    pub const TRACE: &str = "trace";
    pub const ADDRESS_OF: &str = "address_of";
    pub const MAKE_STRUCT: &str = "make_struct";
    pub const ALLOCA: &str = "alloca";
    pub const SIZE_OF_BUFFER_T: &str = "size_of_halide_buffer_t";
    pub const BUFFER_CROP: &str = "buffer_crop";
    pub const BUFFER_GET_MIN: &str = "buffer_get_min";
    pub const BUFFER_GET_MAX: &str = "buffer_get_max";
    pub const BUFFER_GET_SHAPE: &str = "buffer_get_shape";
    pub const BUFFER_RETIRE_CROP: &str = "buffer_retire_crop_after_extern_stage";
    pub const BUFFER_RETIRE_CROPS: &str = "buffer_retire_crops_after_extern_stage";
    pub const CREATE_BUFFER_T: &str = "create_buffer_t";
    pub const REWRITE_BUFFER: &str = "rewrite_buffer";
    pub const UNSAFE_PROMISE_CLAMPED: &str = "unsafe_promise_clamped";
    pub const PROMISE_CLAMPED: &str = "promise_clamped";
    pub const REGISTER_DESTRUCTOR: &str = "register_destructor";
    pub const PREFETCH: &str = "prefetch";
    pub const STRINGIFY: &str = "stringify";
    pub const RETURN_SECOND: &str = "return_second";
    pub const UNDEF: &str = "undef";
    pub const GPU_THREAD_BARRIER: &str = "gpu_thread_barrier";
}

/// The payload of an expression node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExprKind {
    IntImm { value: i64 },
    UIntImm { value: u64 },
    FloatImm { value: FloatBits },
    StringImm { value: String },
    Variable { name: String, binding: VarBinding },
    Cast { value: Expr },
    Reinterpret { value: Expr },
    Binary { op: BinaryOp, a: Expr, b: Expr },
    Cmp { op: CmpOp, a: Expr, b: Expr },
    And { a: Expr, b: Expr },
    Or { a: Expr, b: Expr },
    Not { a: Expr },
    Select { condition: Expr, true_value: Expr, false_value: Expr },
    /// A read of `lanes` elements from a flat buffer.
    Load {
        name: String,
        index: Expr,
        predicate: Expr,
        alignment: ModulusRemainder,
        binding: VarBinding,
    },
    /// The arithmetic progression `base + stride * [0, 1, .., lanes-1]`.
    Ramp { base: Expr, stride: Expr, lanes: u16 },
    /// A value replicated across lanes.
    Broadcast { value: Expr, lanes: u16 },
    /// Lane selection from the concatenation of `vectors`.
    Shuffle { vectors: Vec<Expr>, indices: Vec<i32> },
    /// Horizontal reduction to `type.lanes` output lanes.
    VectorReduce { op: ReduceOp, value: Expr },
    Let { name: String, value: Expr, body: Expr },
    Call {
        name: String,
        args: Vec<Expr>,
        kind: CallKind,
        /// Which tuple component of a pipeline function this call reads.
        value_index: usize,
    },
}

/// `f64` wrapper comparing and hashing bitwise, so float immediates can
/// participate in structural equality.
#[derive(Debug, Clone, Copy)]
pub struct FloatBits(pub f64);

impl PartialEq for FloatBits {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for FloatBits {}

impl std::hash::Hash for FloatBits {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

/// An expression node: its type plus payload.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ExprNode {
    pub ty: Type,
    pub kind: ExprKind,
}

/// A shared, immutable expression.
#[derive(Debug, Clone, Eq)]
pub struct Expr(Arc<ExprNode>);

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || *self.0 == *other.0
    }
}

impl std::hash::Hash for Expr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Expr {
    fn new(ty: Type, kind: ExprKind) -> Expr {
        Expr(Arc::new(ExprNode { ty, kind }))
    }

    pub fn ty(&self) -> Type {
        self.0.ty
    }

    pub fn kind(&self) -> &ExprKind {
        &self.0.kind
    }

    pub fn lanes(&self) -> u16 {
        self.0.ty.lanes
    }

    /// Pointer identity: true iff both handles refer to the same node.
    pub fn same_as(&self, other: &Expr) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Deep structural equality (also reachable through `==`).
    pub fn equal(&self, other: &Expr) -> bool {
        self == other
    }

    // -- immediates ------------------------------------------------------

    pub fn int_of(ty: Type, value: i64) -> Expr {
        assert!(ty.is_int() && ty.is_scalar(), "IntImm requires a scalar int type");
        Expr::new(ty, ExprKind::IntImm { value })
    }

    pub fn uint_of(ty: Type, value: u64) -> Expr {
        assert!(
            ty.is_uint() && ty.is_scalar(),
            "UIntImm requires a scalar uint type"
        );
        Expr::new(ty, ExprKind::UIntImm { value })
    }

    pub fn float_of(ty: Type, value: f64) -> Expr {
        assert!(
            ty.is_float() && ty.is_scalar(),
            "FloatImm requires a scalar float type"
        );
        Expr::new(ty, ExprKind::FloatImm { value: FloatBits(value) })
    }

    pub fn i32(value: i32) -> Expr {
        Expr::int_of(Type::int(32), value as i64)
    }

    pub fn i64(value: i64) -> Expr {
        Expr::int_of(Type::int(64), value)
    }

    pub fn u64(value: u64) -> Expr {
        Expr::uint_of(Type::uint(64), value)
    }

    pub fn f32(value: f32) -> Expr {
        Expr::float_of(Type::float(32), value as f64)
    }

    pub fn string(value: impl Into<String>) -> Expr {
        Expr::new(Type::handle(), ExprKind::StringImm { value: value.into() })
    }

    pub fn bool_imm(value: bool) -> Expr {
        Expr::uint_of(Type::bool_scalar(), value as u64)
    }

    pub fn const_true() -> Expr {
        Expr::bool_imm(true)
    }

    pub fn const_false() -> Expr {
        Expr::bool_imm(false)
    }

    /// An all-true boolean with the given lane count.
    pub fn const_true_lanes(lanes: u16) -> Expr {
        Expr::broadcast(Expr::const_true(), lanes)
    }

    /// Zero of the given type (element zero broadcast for vectors).
    pub fn zero(ty: Type) -> Expr {
        let scalar = match ty.code {
            TypeCode::Int => Expr::int_of(ty.element_of(), 0),
            TypeCode::UInt => Expr::uint_of(ty.element_of(), 0),
            TypeCode::Float => Expr::float_of(ty.element_of(), 0.0),
            TypeCode::Handle => Expr::reinterpret(ty.element_of(), Expr::u64(0)),
        };
        Expr::broadcast(scalar, ty.lanes)
    }

    /// One of the given scalar type.
    pub fn one(ty: Type) -> Expr {
        match ty.code {
            TypeCode::Int => Expr::int_of(ty, 1),
            TypeCode::UInt => Expr::uint_of(ty, 1),
            TypeCode::Float => Expr::float_of(ty, 1.0),
            TypeCode::Handle => panic!("no unit value for handle types"),
        }
    }

    // -- variables -------------------------------------------------------

    pub fn var(ty: Type, name: impl Into<String>) -> Expr {
        Expr::var_bound(ty, name, VarBinding::Free)
    }

    pub fn var_bound(ty: Type, name: impl Into<String>, binding: VarBinding) -> Expr {
        Expr::new(ty, ExprKind::Variable { name: name.into(), binding })
    }

    /// Shorthand for the ubiquitous scalar int32 loop/bound variable.
    pub fn var_i32(name: impl Into<String>) -> Expr {
        Expr::var(Type::int(32), name)
    }

    // -- conversions -----------------------------------------------------

    pub fn cast(ty: Type, value: Expr) -> Expr {
        assert_eq!(
            ty.lanes,
            value.lanes(),
            "Cast must preserve the lane count"
        );
        if value.ty() == ty {
            return value;
        }
        Expr::new(ty, ExprKind::Cast { value })
    }

    pub fn reinterpret(ty: Type, value: Expr) -> Expr {
        Expr::new(ty, ExprKind::Reinterpret { value })
    }

    // -- arithmetic and logic --------------------------------------------

    pub fn binary(op: BinaryOp, a: Expr, b: Expr) -> Expr {
        let (a, b) = match_types(a, b);
        let ty = a.ty();
        Expr::new(ty, ExprKind::Binary { op, a, b })
    }

    pub fn cmp(op: CmpOp, a: Expr, b: Expr) -> Expr {
        let (a, b) = match_types(a, b);
        let ty = Type::bool_vector(a.lanes());
        Expr::new(ty, ExprKind::Cmp { op, a, b })
    }

    pub fn and(a: Expr, b: Expr) -> Expr {
        let (a, b) = match_types(a, b);
        assert!(a.ty().is_bool(), "And requires boolean operands");
        let ty = a.ty();
        Expr::new(ty, ExprKind::And { a, b })
    }

    pub fn or(a: Expr, b: Expr) -> Expr {
        let (a, b) = match_types(a, b);
        assert!(a.ty().is_bool(), "Or requires boolean operands");
        let ty = a.ty();
        Expr::new(ty, ExprKind::Or { a, b })
    }

    pub fn not(a: Expr) -> Expr {
        assert!(a.ty().is_bool(), "Not requires a boolean operand");
        let ty = a.ty();
        Expr::new(ty, ExprKind::Not { a })
    }

    pub fn select(condition: Expr, true_value: Expr, false_value: Expr) -> Expr {
        assert!(condition.ty().is_bool(), "Select condition must be boolean");
        let (true_value, false_value) = match_types(true_value, false_value);
        let lanes = condition.lanes().max(true_value.lanes());
        let true_value = broadcast_to(true_value, lanes);
        let false_value = broadcast_to(false_value, lanes);
        let ty = true_value.ty();
        Expr::new(ty, ExprKind::Select { condition, true_value, false_value })
    }

    // -- memory ----------------------------------------------------------

    pub fn load(
        ty: Type,
        name: impl Into<String>,
        index: Expr,
        predicate: Expr,
        alignment: ModulusRemainder,
        binding: VarBinding,
    ) -> Expr {
        assert_eq!(ty.lanes, index.lanes(), "Load index lanes must match its type");
        assert_eq!(
            ty.lanes,
            predicate.lanes(),
            "Load predicate lanes must match its type"
        );
        Expr::new(
            ty,
            ExprKind::Load {
                name: name.into(),
                index,
                predicate,
                alignment,
                binding,
            },
        )
    }

    /// A load of scalar or ramped index with an all-true predicate.
    pub fn load_unpredicated(
        ty: Type,
        name: impl Into<String>,
        index: Expr,
        binding: VarBinding,
    ) -> Expr {
        let predicate = if ty.lanes == 1 {
            Expr::const_true()
        } else {
            Expr::const_true_lanes(ty.lanes)
        };
        Expr::load(ty, name, index, predicate, ModulusRemainder::unknown(), binding)
    }

    pub fn ramp(base: Expr, stride: Expr, lanes: u16) -> Expr {
        assert!(lanes >= 2, "Ramp requires at least two lanes");
        assert_eq!(base.ty(), stride.ty(), "Ramp base and stride types must match");
        let ty = base.ty().with_lanes(base.lanes() * lanes);
        Expr::new(ty, ExprKind::Ramp { base, stride, lanes })
    }

    pub fn broadcast(value: Expr, lanes: u16) -> Expr {
        assert!(lanes >= 1, "Broadcast requires at least one lane");
        if lanes == 1 {
            return value;
        }
        let ty = value.ty().with_lanes(value.lanes() * lanes);
        Expr::new(ty, ExprKind::Broadcast { value, lanes })
    }

    pub fn shuffle(vectors: Vec<Expr>, indices: Vec<i32>) -> Expr {
        assert!(!vectors.is_empty(), "Shuffle requires at least one vector");
        let element = vectors[0].ty().element_of();
        let mut total = 0u32;
        for v in &vectors {
            assert_eq!(
                v.ty().element_of(),
                element,
                "Shuffle vectors must share an element type"
            );
            total += v.lanes() as u32;
        }
        for &i in &indices {
            assert!(
                i >= 0 && (i as u32) < total,
                "Shuffle index out of range"
            );
        }
        let ty = element.with_lanes(indices.len() as u16);
        Expr::new(ty, ExprKind::Shuffle { vectors, indices })
    }

    /// Lanes `[begin, begin + stride, ..]` of a single vector, `size` of them.
    pub fn slice_vector(vector: Expr, begin: u16, stride: u16, size: u16) -> Expr {
        let indices: Vec<i32> = (0..size)
            .map(|i| (begin + i * stride) as i32)
            .collect();
        Expr::shuffle(vec![vector], indices)
    }

    /// A single lane of a vector as a scalar.
    pub fn extract_lane(vector: Expr, lane: u16) -> Expr {
        if vector.ty().is_scalar() {
            return vector;
        }
        Expr::slice_vector(vector, lane, 1, 1)
    }

    pub fn vector_reduce(op: ReduceOp, value: Expr, output_lanes: u16) -> Expr {
        assert!(
            value.lanes() % output_lanes == 0,
            "VectorReduce input lanes must be a multiple of the output lanes"
        );
        if value.lanes() == output_lanes {
            return value;
        }
        let ty = value.ty().with_lanes(output_lanes);
        Expr::new(ty, ExprKind::VectorReduce { op, value })
    }

    // -- binding and calls -----------------------------------------------

    pub fn let_in(name: impl Into<String>, value: Expr, body: Expr) -> Expr {
        let ty = body.ty();
        Expr::new(ty, ExprKind::Let { name: name.into(), value, body })
    }

    pub fn call(ty: Type, name: impl Into<String>, args: Vec<Expr>, kind: CallKind) -> Expr {
        Expr::call_indexed(ty, name, args, kind, 0)
    }

    pub fn call_indexed(
        ty: Type,
        name: impl Into<String>,
        args: Vec<Expr>,
        kind: CallKind,
        value_index: usize,
    ) -> Expr {
        Expr::new(ty, ExprKind::Call { name: name.into(), args, kind, value_index })
    }

    // -- inspection helpers ----------------------------------------------

    pub fn as_const_int(&self) -> Option<i64> {
        match self.kind() {
            ExprKind::IntImm { value } => Some(*value),
            ExprKind::UIntImm { value } => i64::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(
            self.kind(),
            ExprKind::IntImm { .. } | ExprKind::UIntImm { .. } | ExprKind::FloatImm { .. }
        )
    }

    pub fn as_variable(&self) -> Option<&str> {
        match self.kind() {
            ExprKind::Variable { name, .. } => Some(name),
            _ => None,
        }
    }

    /// True for calls to the named intrinsic (either purity flavor).
    pub fn is_intrinsic(&self, intrinsic_name: &str) -> bool {
        match self.kind() {
            ExprKind::Call { name, kind, .. } => {
                matches!(kind, CallKind::Intrinsic | CallKind::PureIntrinsic)
                    && name == intrinsic_name
            }
            _ => false,
        }
    }
}

/// Broadcast a scalar side so both operands share a lane count, then check
/// the scalar types agree. Integer immediates adopt the other side's type.
pub fn match_types(a: Expr, b: Expr) -> (Expr, Expr) {
    if a.ty() == b.ty() {
        return (a, b);
    }

    // Adopt the non-immediate side's element type for bare int immediates.
    let (a, b) = match (a.as_const_int(), b.as_const_int()) {
        (Some(v), None) if !b.ty().is_handle() => {
            (coerce_const(v, b.ty().element_of()), b)
        }
        (None, Some(v)) if !a.ty().is_handle() => {
            let coerced = coerce_const(v, a.ty().element_of());
            (a, coerced)
        }
        _ => (a, b),
    };

    let lanes = a.lanes().max(b.lanes());
    let a = broadcast_to(a, lanes);
    let b = broadcast_to(b, lanes);
    assert_eq!(
        a.ty(),
        b.ty(),
        "type mismatch between operands: {} vs {}",
        a.ty(),
        b.ty()
    );
    (a, b)
}

fn coerce_const(value: i64, ty: Type) -> Expr {
    match ty.code {
        TypeCode::Int => Expr::int_of(ty, value),
        TypeCode::UInt if ty.is_bool() => Expr::bool_imm(value != 0),
        TypeCode::UInt => Expr::uint_of(ty, value as u64),
        TypeCode::Float => Expr::float_of(ty, value as f64),
        TypeCode::Handle => panic!("cannot coerce an integer constant to a handle"),
    }
}

fn broadcast_to(e: Expr, lanes: u16) -> Expr {
    if e.lanes() == lanes {
        e
    } else {
        assert!(
            lanes % e.lanes() == 0,
            "mismatched lane counts: {} vs {}",
            e.lanes(),
            lanes
        );
        Expr::broadcast(e.clone(), lanes / e.lanes())
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Expr {
        Expr::i32(v)
    }
}

impl From<bool> for Expr {
    fn from(v: bool) -> Expr {
        Expr::bool_imm(v)
    }
}

impl<T: Into<Expr>> std::ops::Add<T> for Expr {
    type Output = Expr;
    fn add(self, rhs: T) -> Expr {
        Expr::binary(BinaryOp::Add, self, rhs.into())
    }
}

impl<T: Into<Expr>> std::ops::Sub<T> for Expr {
    type Output = Expr;
    fn sub(self, rhs: T) -> Expr {
        Expr::binary(BinaryOp::Sub, self, rhs.into())
    }
}

impl<T: Into<Expr>> std::ops::Mul<T> for Expr {
    type Output = Expr;
    fn mul(self, rhs: T) -> Expr {
        Expr::binary(BinaryOp::Mul, self, rhs.into())
    }
}

impl<T: Into<Expr>> std::ops::Div<T> for Expr {
    type Output = Expr;
    fn div(self, rhs: T) -> Expr {
        Expr::binary(BinaryOp::Div, self, rhs.into())
    }
}

impl<T: Into<Expr>> std::ops::Rem<T> for Expr {
    type Output = Expr;
    fn rem(self, rhs: T) -> Expr {
        Expr::binary(BinaryOp::Mod, self, rhs.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_as_is_pointer_identity() {
        let a = Expr::i32(1) + Expr::i32(2);
        let b = a.clone();
        let c = Expr::i32(1) + Expr::i32(2);
        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
        assert_eq!(a, c);
    }

    #[test]
    fn variable_binding_is_part_of_identity() {
        let free = Expr::var_i32("x");
        let rdom = Expr::var_bound(Type::int(32), "x", VarBinding::ReductionDomain);
        assert_ne!(free, rdom);
        assert_eq!(free, Expr::var_i32("x"));
    }

    #[test]
    fn binary_types_propagate() {
        let x = Expr::var_i32("x");
        let e = x + 1;
        assert_eq!(e.ty(), Type::int(32));
    }

    #[test]
    fn cmp_returns_bool_with_operand_lanes() {
        let v = Expr::ramp(Expr::i32(0), Expr::i32(1), 4);
        let c = Expr::cmp(CmpOp::Lt, v, Expr::i32(10));
        assert_eq!(c.ty(), Type::bool_vector(4));
    }

    #[test]
    fn scalar_operand_is_broadcast() {
        let v = Expr::ramp(Expr::i32(0), Expr::i32(1), 4);
        let e = v + 7;
        assert_eq!(e.lanes(), 4);
        match e.kind() {
            ExprKind::Binary { b, .. } => {
                assert!(matches!(b.kind(), ExprKind::Broadcast { .. }));
            }
            other => panic!("expected Binary, got {other:?}"),
        }
    }

    #[test]
    fn broadcast_of_one_lane_is_identity() {
        let x = Expr::i32(3);
        let b = Expr::broadcast(x.clone(), 1);
        assert!(b.same_as(&x));
    }

    #[test]
    fn nested_broadcast_multiplies_lanes() {
        let r = Expr::ramp(Expr::i32(0), Expr::i32(1), 4);
        let b = Expr::broadcast(r, 2);
        assert_eq!(b.lanes(), 8);
    }

    #[test]
    #[should_panic]
    fn ramp_requires_two_lanes() {
        let _ = Expr::ramp(Expr::i32(0), Expr::i32(1), 1);
    }

    #[test]
    fn load_lane_invariant() {
        let idx = Expr::ramp(Expr::i32(0), Expr::i32(1), 4);
        let l = Expr::load_unpredicated(
            Type::int(32).with_lanes(4),
            "buf",
            idx,
            VarBinding::Free,
        );
        assert_eq!(l.lanes(), 4);
    }

    #[test]
    fn float_imm_equality_is_bitwise() {
        let a = Expr::float_of(Type::float(64), 0.1);
        let b = Expr::float_of(Type::float(64), 0.1);
        assert_eq!(a, b);
        let nan1 = Expr::float_of(Type::float(64), f64::NAN);
        let nan2 = Expr::float_of(Type::float(64), f64::NAN);
        assert_eq!(nan1, nan2);
    }

    #[test]
    fn extract_lane_of_scalar_is_identity() {
        let x = Expr::var_i32("x");
        assert!(Expr::extract_lane(x.clone(), 0).same_as(&x));
    }

    #[test]
    fn vector_reduce_to_same_lanes_is_identity() {
        let v = Expr::ramp(Expr::i32(0), Expr::i32(1), 4);
        let r = Expr::vector_reduce(ReduceOp::Add, v.clone(), 4);
        assert!(r.same_as(&v));
        let r1 = Expr::vector_reduce(ReduceOp::Add, v, 1);
        assert_eq!(r1.lanes(), 1);
    }
}
