//! Expression trees used by filters, maps and join keys.
//!
//! Plans hold name-based [`Expr`]s. Before execution an expression is bound
//! against its input schema, which resolves field names to positions and
//! checks types, producing a [`BoundExpr`].

use std::cmp::Ordering;
use std::fmt;

use crate::types::{DataType, Schema, TypeError, Value};

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
    /// `==`
    Eq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// Logical and.
    And,
    /// Logical or.
    Or,
}

impl BinaryOp {
    fn is_arithmetic(self) -> bool {
        matches!(self, Self::Add | Self::Sub | Self::Mul | Self::Div | Self::Mod)
    }

    fn is_ordering(self) -> bool {
        matches!(self, Self::Lt | Self::LtEq | Self::Gt | Self::GtEq)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::And => "AND",
            Self::Or => "OR",
        };
        f.write_str(s)
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Logical negation.
    Not,
    /// Arithmetic negation.
    Neg,
}

/// A name-based expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Reference to an input field.
    Field(String),
    /// Constant.
    Literal(Value),
    /// Binary operation.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Unary operation.
    Unary {
        /// Operator.
        op: UnaryOp,
        /// Operand.
        expr: Box<Expr>,
    },
}

/// Field reference.
pub fn col(name: impl Into<String>) -> Expr {
    Expr::Field(name.into())
}

/// Literal value.
pub fn lit(value: impl Into<Value>) -> Expr {
    Expr::Literal(value.into())
}

macro_rules! binary_builders {
    ($($(#[$doc:meta])* $name:ident => $op:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            #[must_use]
            pub fn $name(self, other: Expr) -> Expr {
                Expr::binary(BinaryOp::$op, self, other)
            }
        )*
    };
}

impl Expr {
    /// Builds a binary expression.
    #[must_use]
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    binary_builders! {
        /// `self == other`
        equals => Eq,
        /// `self != other`
        not_equals => NotEq,
        /// `self < other`
        lt => Lt,
        /// `self <= other`
        lt_eq => LtEq,
        /// `self > other`
        gt => Gt,
        /// `self >= other`
        gt_eq => GtEq,
        /// `self AND other`
        and => And,
        /// `self OR other`
        or => Or,
        /// `self % other`
        modulo => Mod,
    }

    /// Field names referenced anywhere in the tree.
    #[must_use]
    pub fn referenced_fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Field(name) => out.push(name),
            Expr::Literal(_) => {}
            Expr::Binary { left, right, .. } => {
                left.collect_fields(out);
                right.collect_fields(out);
            }
            Expr::Unary { expr, .. } => expr.collect_fields(out),
        }
    }

    /// Infers the result type against `schema`.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::FieldNotFound`] for unknown fields and
    /// [`TypeError::Incompatible`] for ill-typed operations.
    pub fn infer_type(&self, schema: &Schema) -> Result<DataType, TypeError> {
        self.bind(schema).map(|(_, ty)| ty)
    }

    /// Resolves field names to positions and type-checks the tree.
    ///
    /// # Errors
    ///
    /// See [`Expr::infer_type`].
    pub fn bind(&self, schema: &Schema) -> Result<(BoundExpr, DataType), TypeError> {
        match self {
            Expr::Field(name) => {
                let index = schema
                    .index_of(name)
                    .ok_or_else(|| TypeError::FieldNotFound(name.clone()))?;
                let ty = schema.fields()[index].data_type().clone();
                Ok((BoundExpr::Column(index), ty))
            }
            Expr::Literal(value) => Ok((BoundExpr::Literal(value.clone()), value.data_type())),
            Expr::Binary { op, left, right } => {
                let (l, lt) = left.bind(schema)?;
                let (r, rt) = right.bind(schema)?;
                let ty = binary_type(*op, &lt, &rt)?;
                Ok((
                    BoundExpr::Binary {
                        op: *op,
                        left: Box::new(l),
                        right: Box::new(r),
                    },
                    ty,
                ))
            }
            Expr::Unary { op, expr } => {
                let (inner, ty) = expr.bind(schema)?;
                let out = match (op, &ty) {
                    (UnaryOp::Not, DataType::Boolean) => DataType::Boolean,
                    (UnaryOp::Neg, DataType::Integer { bits, lower, upper }) => {
                        DataType::Integer {
                            bits: *bits,
                            lower: -upper,
                            upper: -lower,
                        }
                    }
                    (UnaryOp::Neg, DataType::Float { .. }) => ty.clone(),
                    _ => {
                        return Err(TypeError::Incompatible {
                            left: format!("{op:?}"),
                            right: ty.to_string(),
                        })
                    }
                };
                Ok((
                    BoundExpr::Unary {
                        op: *op,
                        expr: Box::new(inner),
                    },
                    out,
                ))
            }
        }
    }
}

fn binary_type(op: BinaryOp, left: &DataType, right: &DataType) -> Result<DataType, TypeError> {
    let incompatible = || TypeError::Incompatible {
        left: left.to_string(),
        right: right.to_string(),
    };
    if op.is_arithmetic() {
        if !(left.is_numeric() && right.is_numeric()) {
            return Err(incompatible());
        }
        return left.try_join(right);
    }
    if op.is_ordering() {
        if !(left.is_numeric() && right.is_numeric()) {
            return Err(incompatible());
        }
        return Ok(DataType::Boolean);
    }
    match op {
        BinaryOp::Eq | BinaryOp::NotEq => {
            let comparable = (left.is_numeric() && right.is_numeric())
                || !left.join(right).is_undefined()
                || matches!((left, right), (DataType::Char { .. }, DataType::Char { .. }));
            if comparable {
                Ok(DataType::Boolean)
            } else {
                Err(incompatible())
            }
        }
        BinaryOp::And | BinaryOp::Or if left.is_boolean() && right.is_boolean() => {
            Ok(DataType::Boolean)
        }
        _ => Err(incompatible()),
    }
}

impl std::ops::Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Add, self, rhs)
    }
}

impl std::ops::Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Sub, self, rhs)
    }
}

impl std::ops::Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Mul, self, rhs)
    }
}

impl std::ops::Div for Expr {
    type Output = Expr;
    fn div(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Div, self, rhs)
    }
}

impl std::ops::Not for Expr {
    type Output = Expr;
    fn not(self) -> Expr {
        Expr::Unary {
            op: UnaryOp::Not,
            expr: Box::new(self),
        }
    }
}

impl std::ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Unary {
            op: UnaryOp::Neg,
            expr: Box::new(self),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Field(name) => write!(f, "{name}"),
            Expr::Literal(Value::Text(s)) => write!(f, "'{s}'"),
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Binary { op, left, right } => write!(f, "({left} {op} {right})"),
            Expr::Unary { op: UnaryOp::Not, expr } => write!(f, "NOT {expr}"),
            Expr::Unary { op: UnaryOp::Neg, expr } => write!(f, "-{expr}"),
        }
    }
}

/// Errors raised while evaluating a bound expression against a record.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    /// Integer division or modulo by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// Integer result does not fit into 64 bits.
    #[error("integer overflow in {0}")]
    Overflow(BinaryOp),

    /// Operand values do not match the bound types (malformed record).
    #[error("operator {op} cannot be applied to {left} and {right}")]
    TypeMismatch {
        /// Operator.
        op: String,
        /// Left value.
        left: String,
        /// Right value.
        right: String,
    },

    /// Column index past the record width.
    #[error("column {0} missing from record")]
    MissingColumn(usize),
}

/// An expression with resolved field positions.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundExpr {
    /// Field at the given position.
    Column(usize),
    /// Constant.
    Literal(Value),
    /// Binary operation.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        left: Box<BoundExpr>,
        /// Right operand.
        right: Box<BoundExpr>,
    },
    /// Unary operation.
    Unary {
        /// Operator.
        op: UnaryOp,
        /// Operand.
        expr: Box<BoundExpr>,
    },
}

impl BoundExpr {
    /// Evaluates against one decoded record.
    ///
    /// # Errors
    ///
    /// Returns an [`EvalError`] for arithmetic faults or malformed values.
    pub fn evaluate(&self, record: &[Value]) -> Result<Value, EvalError> {
        match self {
            BoundExpr::Column(i) => record.get(*i).cloned().ok_or(EvalError::MissingColumn(*i)),
            BoundExpr::Literal(v) => Ok(v.clone()),
            BoundExpr::Binary { op, left, right } => {
                apply_binary(*op, &left.evaluate(record)?, &right.evaluate(record)?)
            }
            BoundExpr::Unary { op, expr } => apply_unary(*op, &expr.evaluate(record)?),
        }
    }
}

/// Applies a binary operator to two values.
///
/// Integers are computed in 128 bits and narrowed back; any float operand
/// switches to IEEE arithmetic.
///
/// # Errors
///
/// Returns an [`EvalError`] for arithmetic faults or mismatched operands.
pub fn apply_binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    let mismatch = || EvalError::TypeMismatch {
        op: op.to_string(),
        left: left.to_string(),
        right: right.to_string(),
    };
    match op {
        BinaryOp::And | BinaryOp::Or => {
            let (Some(l), Some(r)) = (left.as_bool(), right.as_bool()) else {
                return Err(mismatch());
            };
            Ok(Value::Bool(if op == BinaryOp::And { l && r } else { l || r }))
        }
        BinaryOp::Eq | BinaryOp::NotEq => {
            let equal = match compare(left, right) {
                Some(ordering) => ordering == Ordering::Equal,
                None => left == right,
            };
            Ok(Value::Bool(equal == (op == BinaryOp::Eq)))
        }
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            let ordering = compare(left, right).ok_or_else(mismatch)?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::LtEq => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        _ if left.is_float() || right.is_float() => {
            let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) else {
                return Err(mismatch());
            };
            Ok(Value::Float(match op {
                BinaryOp::Add => l + r,
                BinaryOp::Sub => l - r,
                BinaryOp::Mul => l * r,
                BinaryOp::Div => l / r,
                _ => l % r,
            }))
        }
        _ => {
            let (Some(l), Some(r)) = (as_i128(left), as_i128(right)) else {
                return Err(mismatch());
            };
            let result = match op {
                BinaryOp::Add => l.checked_add(r),
                BinaryOp::Sub => l.checked_sub(r),
                BinaryOp::Mul => l.checked_mul(r),
                BinaryOp::Div | BinaryOp::Mod if r == 0 => return Err(EvalError::DivisionByZero),
                BinaryOp::Div => l.checked_div(r),
                _ => l.checked_rem(r),
            };
            result.and_then(narrow).ok_or(EvalError::Overflow(op))
        }
    }
}

/// Applies a unary operator.
///
/// # Errors
///
/// Returns [`EvalError::TypeMismatch`] for the wrong operand kind.
pub fn apply_unary(op: UnaryOp, value: &Value) -> Result<Value, EvalError> {
    match (op, value) {
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Neg, Value::Float(v)) => Ok(Value::Float(-v)),
        (UnaryOp::Neg, v) => as_i128(v)
            .and_then(|i| narrow(-i))
            .ok_or_else(|| EvalError::TypeMismatch {
                op: format!("{op:?}"),
                left: v.to_string(),
                right: String::new(),
            }),
        (_, v) => Err(EvalError::TypeMismatch {
            op: format!("{op:?}"),
            left: v.to_string(),
            right: String::new(),
        }),
    }
}

fn as_i128(value: &Value) -> Option<i128> {
    match value {
        Value::Int(v) => Some(i128::from(*v)),
        Value::UInt(v) => Some(i128::from(*v)),
        _ => None,
    }
}

fn narrow(value: i128) -> Option<Value> {
    if let Ok(v) = i64::try_from(value) {
        Some(Value::Int(v))
    } else {
        u64::try_from(value).ok().map(Value::UInt)
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    if let (Some(l), Some(r)) = (as_i128(left), as_i128(right)) {
        return Some(l.cmp(&r));
    }
    if left.is_float() || right.is_float() {
        return left.as_f64()?.partial_cmp(&right.as_f64()?);
    }
    match (left, right) {
        (Value::Text(l), Value::Text(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Field;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::uint32()),
            Field::new("speed", DataType::int16()),
            Field::new("ratio", DataType::float32()),
            Field::new("ok", DataType::Boolean),
        ])
        .unwrap()
    }

    #[test]
    fn test_predicate_is_boolean() {
        let pred = col("speed").gt(lit(50)).and(col("ok"));
        assert_eq!(pred.infer_type(&schema()), Ok(DataType::Boolean));
    }

    #[test]
    fn test_arithmetic_widens() {
        let ty = (col("speed") + col("ratio")).infer_type(&schema()).unwrap();
        assert!(matches!(ty, DataType::Float { bits: 32, .. }));
        let ty = (col("speed") * col("id")).infer_type(&schema()).unwrap();
        assert!(matches!(ty, DataType::Integer { bits: 32, .. }));
    }

    #[test]
    fn test_ill_typed() {
        assert!(matches!(
            (col("ok") + lit(1)).infer_type(&schema()),
            Err(TypeError::Incompatible { .. })
        ));
        assert!(matches!(
            col("missing").infer_type(&schema()),
            Err(TypeError::FieldNotFound(_))
        ));
        assert!(col("speed").and(col("ok")).infer_type(&schema()).is_err());
    }

    #[test]
    fn test_evaluate() {
        let (bound, _) = (col("speed") * lit(2) + lit(1)).bind(&schema()).unwrap();
        let record = vec![
            Value::UInt(1),
            Value::Int(21),
            Value::Float(0.5),
            Value::Bool(true),
        ];
        assert_eq!(bound.evaluate(&record), Ok(Value::Int(43)));

        let (pred, _) = col("ratio").lt(col("speed")).bind(&schema()).unwrap();
        assert_eq!(pred.evaluate(&record), Ok(Value::Bool(true)));
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(
            apply_binary(BinaryOp::Div, &Value::Int(1), &Value::Int(0)),
            Err(EvalError::DivisionByZero)
        );
    }

    #[test]
    fn test_unsigned_and_signed_compare() {
        assert_eq!(
            apply_binary(BinaryOp::Lt, &Value::Int(-1), &Value::UInt(u64::MAX)),
            Ok(Value::Bool(true))
        );
    }

    #[test]
    fn test_referenced_fields() {
        let expr = col("a").gt(col("b")).or(!col("c"));
        assert_eq!(expr.referenced_fields(), vec!["a", "b", "c"]);
    }
}
