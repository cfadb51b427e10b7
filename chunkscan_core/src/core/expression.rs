use std::{cmp::Ordering, fmt::Display};

use itertools::Itertools;
use thiserror::Error;

use super::{
    db_type::DbType,
    schema::{AttrNumber, AttrSet, TupleDesc},
    tuple::Datum,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparerOperation {
    Equals,
    NotEquals,
    Contains,
    StartsWith,
    EndsWith,
    Greater,
    GreaterOrEquals,
    Less,
    LessOrEquals,
}

impl ComparerOperation {
    /// Pattern operators only run on the host.
    pub fn is_pattern(&self) -> bool {
        matches!(
            self,
            ComparerOperation::Contains | ComparerOperation::StartsWith | ComparerOperation::EndsWith
        )
    }
}

impl Display for ComparerOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ComparerOperation::Equals => "=",
            ComparerOperation::NotEquals => "<>",
            ComparerOperation::Contains => "CONTAINS",
            ComparerOperation::StartsWith => "STARTSWITH",
            ComparerOperation::EndsWith => "ENDSWITH",
            ComparerOperation::Greater => ">",
            ComparerOperation::GreaterOrEquals => ">=",
            ComparerOperation::Less => "<",
            ComparerOperation::LessOrEquals => "<=",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathOperation {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
}

impl Display for MathOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MathOperation::Add => "+",
            MathOperation::Subtract => "-",
            MathOperation::Multiply => "*",
            MathOperation::Divide => "/",
            MathOperation::Modulo => "%",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Next {
    And,
    Or,
}

impl Display for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Next::And => f.write_str("AND"),
            Next::Or => f.write_str("OR"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("integer out of range")]
    Overflow,
    #[error("division by zero")]
    DivisionByZero,
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("column {0} out of range")]
    ColumnOutOfRange(usize),
    #[error("parameter ${0} is not bound")]
    UnboundParam(usize),
}

/// Filter and projection expression tree, evaluated per tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(usize),
    Const(Datum),
    Param(usize),
    Compare {
        op: ComparerOperation,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Math {
        op: MathOperation,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: Next,
        args: Vec<Expr>,
    },
    Not(Box<Expr>),
    IsNull(Box<Expr>),
}

impl Expr {
    pub fn col(attno: usize) -> Expr {
        Expr::Column(attno)
    }

    pub fn constant(value: Datum) -> Expr {
        Expr::Const(value)
    }

    pub fn param(index: usize) -> Expr {
        Expr::Param(index)
    }

    pub fn compare(op: ComparerOperation, left: Expr, right: Expr) -> Expr {
        Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn math(op: MathOperation, left: Expr, right: Expr) -> Expr {
        Expr::Math {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn and(args: Vec<Expr>) -> Expr {
        Expr::Logical { op: Next::And, args }
    }

    pub fn or(args: Vec<Expr>) -> Expr {
        Expr::Logical { op: Next::Or, args }
    }

    pub fn not(arg: Expr) -> Expr {
        Expr::Not(Box::new(arg))
    }

    pub fn is_null(arg: Expr) -> Expr {
        Expr::IsNull(Box::new(arg))
    }

    pub fn eval(&self, values: &[Datum], params: &[Datum]) -> Result<Datum, EvalError> {
        match self {
            Expr::Column(attno) => values
                .get(*attno)
                .cloned()
                .ok_or(EvalError::ColumnOutOfRange(*attno)),
            Expr::Const(value) => Ok(value.clone()),
            Expr::Param(index) => params
                .get(*index)
                .cloned()
                .ok_or(EvalError::UnboundParam(*index + 1)),
            Expr::Compare { op, left, right } => {
                let left = left.eval(values, params)?;
                let right = right.eval(values, params)?;
                compare(*op, &left, &right)
            }
            Expr::Math { op, left, right } => {
                let left = left.eval(values, params)?;
                let right = right.eval(values, params)?;
                arithmetic(*op, &left, &right)
            }
            Expr::Logical { op, args } => {
                let mut saw_null = false;
                for arg in args {
                    match arg.eval(values, params)? {
                        Datum::Null => saw_null = true,
                        Datum::Bool(b) => match (op, b) {
                            (Next::And, false) => return Ok(Datum::Bool(false)),
                            (Next::Or, true) => return Ok(Datum::Bool(true)),
                            _ => {}
                        },
                        other => {
                            return Err(EvalError::TypeMismatch(format!(
                                "{} argument is not boolean: {}",
                                op, other
                            )));
                        }
                    }
                }
                if saw_null {
                    Ok(Datum::Null)
                } else {
                    Ok(Datum::Bool(*op == Next::And))
                }
            }
            Expr::Not(arg) => match arg.eval(values, params)? {
                Datum::Null => Ok(Datum::Null),
                Datum::Bool(b) => Ok(Datum::Bool(!b)),
                other => Err(EvalError::TypeMismatch(format!("NOT argument is not boolean: {}", other))),
            },
            Expr::IsNull(arg) => Ok(Datum::Bool(arg.eval(values, params)?.is_null())),
        }
    }

    /// False if any node has no device implementation.
    pub fn is_device_executable(&self) -> bool {
        match self {
            Expr::Column(_) | Expr::Const(_) | Expr::Param(_) => true,
            Expr::Compare { op, left, right } => {
                !op.is_pattern() && left.is_device_executable() && right.is_device_executable()
            }
            Expr::Math { left, right, .. } => {
                left.is_device_executable() && right.is_device_executable()
            }
            Expr::Logical { args, .. } => args.iter().all(Expr::is_device_executable),
            Expr::Not(arg) | Expr::IsNull(arg) => arg.is_device_executable(),
        }
    }

    pub fn result_type(&self, desc: &TupleDesc, params: &[Datum]) -> Option<DbType> {
        match self {
            Expr::Column(attno) => desc.attr(*attno).map(|a| a.db_type),
            Expr::Const(value) => value.db_type(),
            Expr::Param(index) => params.get(*index).and_then(Datum::db_type),
            Expr::Compare { .. } | Expr::Logical { .. } | Expr::Not(_) | Expr::IsNull(_) => {
                Some(DbType::BOOL)
            }
            Expr::Math { left, right, .. } => {
                match (left.result_type(desc, params)?, right.result_type(desc, params)?) {
                    (DbType::F64, _) | (_, DbType::F64) => Some(DbType::F64),
                    (DbType::I64, _) | (_, DbType::I64) => Some(DbType::I64),
                    (DbType::I32, DbType::I32) => Some(DbType::I32),
                    _ => None,
                }
            }
        }
    }

    pub fn referenced_columns(&self, set: &mut AttrSet) {
        match self {
            Expr::Column(attno) => set.insert(*attno as AttrNumber),
            Expr::Const(_) | Expr::Param(_) => {}
            Expr::Compare { left, right, .. } | Expr::Math { left, right, .. } => {
                left.referenced_columns(set);
                right.referenced_columns(set);
            }
            Expr::Logical { args, .. } => args.iter().for_each(|a| a.referenced_columns(set)),
            Expr::Not(arg) | Expr::IsNull(arg) => arg.referenced_columns(set),
        }
    }

    /// Human readable form, using attribute names from `desc`.
    pub fn deparse(&self, desc: &TupleDesc) -> String {
        match self {
            Expr::Column(attno) => desc
                .attr(*attno)
                .map(|a| a.name.clone())
                .unwrap_or_else(|| format!("#{}", attno)),
            Expr::Const(value) => value.to_string(),
            Expr::Param(index) => format!("${}", index + 1),
            Expr::Compare { op, left, right } => {
                format!("({} {} {})", left.deparse(desc), op, right.deparse(desc))
            }
            Expr::Math { op, left, right } => {
                format!("({} {} {})", left.deparse(desc), op, right.deparse(desc))
            }
            Expr::Logical { op, args } => format!(
                "({})",
                args.iter().map(|a| a.deparse(desc)).join(&format!(" {} ", op))
            ),
            Expr::Not(arg) => format!("NOT {}", arg.deparse(desc)),
            Expr::IsNull(arg) => format!("({} IS NULL)", arg.deparse(desc)),
        }
    }
}

fn compare(op: ComparerOperation, left: &Datum, right: &Datum) -> Result<Datum, EvalError> {
    if left.is_null() || right.is_null() {
        return Ok(Datum::Null);
    }

    if op.is_pattern() {
        let (Datum::Text(l), Datum::Text(r)) = (left, right) else {
            return Err(EvalError::TypeMismatch(format!(
                "{} needs text operands, got {} and {}",
                op, left, right
            )));
        };
        return Ok(Datum::Bool(match op {
            ComparerOperation::Contains => l.contains(r.as_str()),
            ComparerOperation::StartsWith => l.starts_with(r.as_str()),
            _ => l.ends_with(r.as_str()),
        }));
    }

    let ordering = match (left, right) {
        (Datum::Text(l), Datum::Text(r)) => l.cmp(r),
        (Datum::Bool(l), Datum::Bool(r)) => l.cmp(r),
        (Datum::F64(_), _) | (_, Datum::F64(_)) => {
            let (l, r) = (as_f64(left)?, as_f64(right)?);
            // NaN sorts above every other value.
            l.partial_cmp(&r).unwrap_or_else(|| l.is_nan().cmp(&r.is_nan()))
        }
        _ => as_i64(left)?.cmp(&as_i64(right)?),
    };

    Ok(Datum::Bool(match op {
        ComparerOperation::Equals => ordering == Ordering::Equal,
        ComparerOperation::NotEquals => ordering != Ordering::Equal,
        ComparerOperation::Greater => ordering == Ordering::Greater,
        ComparerOperation::GreaterOrEquals => ordering != Ordering::Less,
        ComparerOperation::Less => ordering == Ordering::Less,
        ComparerOperation::LessOrEquals => ordering != Ordering::Greater,
        ComparerOperation::Contains | ComparerOperation::StartsWith | ComparerOperation::EndsWith => {
            return Err(EvalError::TypeMismatch(format!("{} on non-text operands", op)));
        }
    }))
}

fn arithmetic(op: MathOperation, left: &Datum, right: &Datum) -> Result<Datum, EvalError> {
    if left.is_null() || right.is_null() {
        return Ok(Datum::Null);
    }

    match (left, right) {
        (Datum::I32(l), Datum::I32(r)) => {
            let (l, r) = (*l, *r);
            let value = match op {
                MathOperation::Add => l.checked_add(r),
                MathOperation::Subtract => l.checked_sub(r),
                MathOperation::Multiply => l.checked_mul(r),
                MathOperation::Divide | MathOperation::Modulo if r == 0 => {
                    return Err(EvalError::DivisionByZero);
                }
                MathOperation::Divide => l.checked_div(r),
                MathOperation::Modulo => l.checked_rem(r),
            };
            value.map(Datum::I32).ok_or(EvalError::Overflow)
        }
        (Datum::F64(_), _) | (_, Datum::F64(_)) => {
            let (l, r) = (as_f64(left)?, as_f64(right)?);
            let value = match op {
                MathOperation::Add => l + r,
                MathOperation::Subtract => l - r,
                MathOperation::Multiply => l * r,
                MathOperation::Divide | MathOperation::Modulo if r == 0.0 => {
                    return Err(EvalError::DivisionByZero);
                }
                MathOperation::Divide => l / r,
                MathOperation::Modulo => l % r,
            };
            Ok(Datum::F64(value))
        }
        _ => {
            let (l, r) = (as_i64(left)?, as_i64(right)?);
            let value = match op {
                MathOperation::Add => l.checked_add(r),
                MathOperation::Subtract => l.checked_sub(r),
                MathOperation::Multiply => l.checked_mul(r),
                MathOperation::Divide | MathOperation::Modulo if r == 0 => {
                    return Err(EvalError::DivisionByZero);
                }
                MathOperation::Divide => l.checked_div(r),
                MathOperation::Modulo => l.checked_rem(r),
            };
            value.map(Datum::I64).ok_or(EvalError::Overflow)
        }
    }
}

fn as_i64(value: &Datum) -> Result<i64, EvalError> {
    match value {
        Datum::I32(v) => Ok(*v as i64),
        Datum::I64(v) => Ok(*v),
        other => Err(EvalError::TypeMismatch(format!("{} is not an integer", other))),
    }
}

fn as_f64(value: &Datum) -> Result<f64, EvalError> {
    match value {
        Datum::I32(v) => Ok(*v as f64),
        Datum::I64(v) => Ok(*v as f64),
        Datum::F64(v) => Ok(*v),
        other => Err(EvalError::TypeMismatch(format!("{} is not numeric", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::Attribute;

    fn desc() -> TupleDesc {
        TupleDesc::new(vec![
            Attribute::new("id", DbType::I32),
            Attribute::new("amount", DbType::F64),
            Attribute::new("name", DbType::STRING),
        ])
    }

    #[test]
    fn test_numeric_comparisons_promote() {
        let values = [Datum::I32(5), Datum::F64(5.0), Datum::Text("x".into())];
        let eq = Expr::compare(ComparerOperation::Equals, Expr::col(0), Expr::col(1));
        assert_eq!(eq.eval(&values, &[]).unwrap(), Datum::Bool(true));

        let gt = Expr::compare(ComparerOperation::Greater, Expr::col(0), Expr::constant(Datum::I64(4)));
        assert_eq!(gt.eval(&values, &[]).unwrap(), Datum::Bool(true));
    }

    #[test]
    fn test_three_valued_logic() {
        let values = [Datum::Null, Datum::F64(1.0), Datum::Text("x".into())];
        let null_cmp = Expr::compare(ComparerOperation::Less, Expr::col(0), Expr::constant(Datum::I32(3)));
        assert_eq!(null_cmp.eval(&values, &[]).unwrap(), Datum::Null);

        let and_false = Expr::and(vec![null_cmp.clone(), Expr::constant(Datum::Bool(false))]);
        assert_eq!(and_false.eval(&values, &[]).unwrap(), Datum::Bool(false));

        let and_null = Expr::and(vec![null_cmp.clone(), Expr::constant(Datum::Bool(true))]);
        assert_eq!(and_null.eval(&values, &[]).unwrap(), Datum::Null);

        let or_true = Expr::or(vec![null_cmp.clone(), Expr::constant(Datum::Bool(true))]);
        assert_eq!(or_true.eval(&values, &[]).unwrap(), Datum::Bool(true));

        assert_eq!(Expr::not(null_cmp).eval(&values, &[]).unwrap(), Datum::Null);
        assert_eq!(Expr::is_null(Expr::col(0)).eval(&values, &[]).unwrap(), Datum::Bool(true));
    }

    #[test]
    fn test_checked_arithmetic() {
        let values = [Datum::I32(i32::MAX), Datum::F64(0.0), Datum::Null];
        let overflow = Expr::math(MathOperation::Add, Expr::col(0), Expr::constant(Datum::I32(1)));
        assert_eq!(overflow.eval(&values, &[]), Err(EvalError::Overflow));

        let widened = Expr::math(MathOperation::Add, Expr::col(0), Expr::constant(Datum::I64(1)));
        assert_eq!(widened.eval(&values, &[]).unwrap(), Datum::I64(i32::MAX as i64 + 1));

        let div = Expr::math(MathOperation::Divide, Expr::constant(Datum::I32(1)), Expr::col(1));
        assert_eq!(div.eval(&values, &[]), Err(EvalError::DivisionByZero));
    }

    #[test]
    fn test_pattern_ops_are_host_only() {
        let values = [Datum::I32(1), Datum::F64(1.0), Datum::Text("hello world".into())];
        let contains = Expr::compare(
            ComparerOperation::Contains,
            Expr::col(2),
            Expr::constant(Datum::Text("lo w".into())),
        );
        assert_eq!(contains.eval(&values, &[]).unwrap(), Datum::Bool(true));
        assert!(!contains.is_device_executable());
        assert!(Expr::and(vec![Expr::constant(Datum::Bool(true))]).is_device_executable());

        let bad = Expr::compare(ComparerOperation::StartsWith, Expr::col(0), Expr::col(2));
        assert!(matches!(bad.eval(&values, &[]), Err(EvalError::TypeMismatch(_))));
    }

    #[test]
    fn test_params_and_columns() {
        let desc = desc();
        let expr = Expr::and(vec![
            Expr::compare(ComparerOperation::GreaterOrEquals, Expr::col(0), Expr::param(0)),
            Expr::compare(ComparerOperation::NotEquals, Expr::col(2), Expr::constant(Datum::Text("z".into()))),
        ]);
        assert_eq!(expr.deparse(&desc), "((id >= $1) AND (name <> 'z'))");

        let mut set = AttrSet::new();
        expr.referenced_columns(&mut set);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 2]);

        let values = [Datum::I32(3), Datum::F64(0.0), Datum::Text("a".into())];
        assert_eq!(expr.eval(&values, &[]), Err(EvalError::UnboundParam(1)));
        assert_eq!(expr.eval(&values, &[Datum::I32(3)]).unwrap(), Datum::Bool(true));
        assert_eq!(expr.result_type(&desc, &[]), Some(DbType::BOOL));

        let sum = Expr::math(MathOperation::Multiply, Expr::col(0), Expr::col(1));
        assert_eq!(sum.result_type(&desc, &[]), Some(DbType::F64));
    }
}
