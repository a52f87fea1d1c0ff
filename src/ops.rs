/// Lane-wise arithmetic on register values.
///
/// Integer lanes are 1, 2, 4 or 8 bytes; float lanes are 4 (`f32`) or
/// 8 (`f64`) bytes. Integer arithmetic wraps at the lane width.
use crate::error::ExecutionError;
use crate::program::{BinaryOp, CastOp, Predicate, Type};
use crate::value::TypedValue;

fn int_lanes(value: &TypedValue) -> Result<(), ExecutionError> {
    match value.size {
        1 | 2 | 4 | 8 => Ok(()),
        n => Err(ExecutionError::Unsupported(format!("{n}-byte integer lanes"))),
    }
}

fn float_lanes(value: &TypedValue) -> Result<(), ExecutionError> {
    match value.size {
        4 | 8 => Ok(()),
        n => Err(ExecutionError::Unsupported(format!("{n}-byte float lanes"))),
    }
}

fn same_shape(lhs: &TypedValue, rhs: &TypedValue) -> Result<(), ExecutionError> {
    if lhs.size == rhs.size && lhs.num == rhs.num {
        Ok(())
    } else {
        Err(ExecutionError::Unsupported(format!(
            "operands of shape {}x{} and {}x{}",
            lhs.num, lhs.size, rhs.num, rhs.size
        )))
    }
}

fn is_float_op(op: BinaryOp) -> bool {
    matches!(
        op,
        BinaryOp::FAdd
            | BinaryOp::FSub
            | BinaryOp::FMul
            | BinaryOp::FDiv
            | BinaryOp::FRem
            | BinaryOp::FMin
            | BinaryOp::FMax
    )
}

pub fn binary(op: BinaryOp, lhs: &TypedValue, rhs: &TypedValue) -> Result<TypedValue, ExecutionError> {
    same_shape(lhs, rhs)?;
    let mut out = TypedValue::new(lhs.size, lhs.num);
    if is_float_op(op) {
        float_lanes(lhs)?;
        for i in 0..lhs.num {
            let (a, b) = (lhs.get_float(i), rhs.get_float(i));
            let r = match op {
                BinaryOp::FAdd => a + b,
                BinaryOp::FSub => a - b,
                BinaryOp::FMul => a * b,
                BinaryOp::FDiv => a / b,
                BinaryOp::FRem => a % b,
                BinaryOp::FMin => a.min(b),
                _ => a.max(b),
            };
            out.set_float(i, r);
        }
        return Ok(out);
    }

    int_lanes(lhs)?;
    let bits = lhs.size as u32 * 8;
    for i in 0..lhs.num {
        let (a, b) = (lhs.get_uint(i), rhs.get_uint(i));
        let (sa, sb) = (lhs.get_sint(i), rhs.get_sint(i));
        let r = match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::UDiv | BinaryOp::URem | BinaryOp::SDiv | BinaryOp::SRem if b == 0 => {
                return Err(ExecutionError::DivisionByZero);
            }
            BinaryOp::UDiv => a / b,
            BinaryOp::URem => a % b,
            BinaryOp::SDiv => sa.wrapping_div(sb) as u64,
            BinaryOp::SRem => sa.wrapping_rem(sb) as u64,
            BinaryOp::And => a & b,
            BinaryOp::Or => a | b,
            BinaryOp::Xor => a ^ b,
            BinaryOp::Shl => a << (b % bits as u64),
            BinaryOp::LShr => a >> (b % bits as u64),
            BinaryOp::AShr => (sa >> (b % bits as u64)) as u64,
            BinaryOp::UMin => a.min(b),
            BinaryOp::UMax => a.max(b),
            BinaryOp::SMin => sa.min(sb) as u64,
            BinaryOp::SMax => sa.max(sb) as u64,
            float => unreachable!("{float:?} handled above"),
        };
        out.set_uint(i, r);
    }
    Ok(out)
}

/// One byte per lane, 1 for true.
pub fn compare(pred: Predicate, lhs: &TypedValue, rhs: &TypedValue) -> Result<TypedValue, ExecutionError> {
    same_shape(lhs, rhs)?;
    let float = matches!(
        pred,
        Predicate::FEq | Predicate::FNe | Predicate::FLt | Predicate::FLe | Predicate::FGt | Predicate::FGe
    );
    if float {
        float_lanes(lhs)?;
    } else {
        int_lanes(lhs)?;
    }

    let mut out = TypedValue::new(1, lhs.num);
    for i in 0..lhs.num {
        let result = if float {
            let (a, b) = (lhs.get_float(i), rhs.get_float(i));
            match pred {
                Predicate::FEq => a == b,
                Predicate::FNe => a != b,
                Predicate::FLt => a < b,
                Predicate::FLe => a <= b,
                Predicate::FGt => a > b,
                _ => a >= b,
            }
        } else {
            let (a, b) = (lhs.get_uint(i), rhs.get_uint(i));
            let (sa, sb) = (lhs.get_sint(i), rhs.get_sint(i));
            match pred {
                Predicate::Eq => a == b,
                Predicate::Ne => a != b,
                Predicate::Ult => a < b,
                Predicate::Ule => a <= b,
                Predicate::Ugt => a > b,
                Predicate::Uge => a >= b,
                Predicate::Slt => sa < sb,
                Predicate::Sle => sa <= sb,
                Predicate::Sgt => sa > sb,
                _ => sa >= sb,
            }
        };
        out.set_uint(i, result as u64);
    }
    Ok(out)
}

/// Convert every lane of `src` to the lane type of `to`.
pub fn cast(op: CastOp, src: &TypedValue, to: &Type) -> Result<TypedValue, ExecutionError> {
    if op == CastOp::Bitcast {
        if src.byte_len() != to.size() {
            return Err(ExecutionError::Unsupported(format!(
                "bitcast of {} bytes to {to:?}",
                src.byte_len()
            )));
        }
        return Ok(src.clone().reshaped(to.lane_size(), to.lanes()));
    }

    let mut out = TypedValue::new(to.lane_size(), src.num);
    match op {
        CastOp::ZExt | CastOp::SExt | CastOp::Trunc => {
            int_lanes(src)?;
            int_lanes(&out)?;
        }
        CastOp::FpToSi | CastOp::FpToUi => {
            float_lanes(src)?;
            int_lanes(&out)?;
        }
        CastOp::SiToFp | CastOp::UiToFp => {
            int_lanes(src)?;
            float_lanes(&out)?;
        }
        CastOp::FpExt | CastOp::FpTrunc => {
            float_lanes(src)?;
            float_lanes(&out)?;
        }
        CastOp::Bitcast => unreachable!(),
    }

    for i in 0..src.num {
        match op {
            CastOp::ZExt | CastOp::Trunc => out.set_uint(i, src.get_uint(i)),
            CastOp::SExt => out.set_uint(i, src.get_sint(i) as u64),
            CastOp::FpToSi => out.set_uint(i, src.get_float(i) as i64 as u64),
            CastOp::FpToUi => out.set_uint(i, src.get_float(i) as u64),
            CastOp::SiToFp => out.set_float(i, src.get_sint(i) as f64),
            CastOp::UiToFp => out.set_float(i, src.get_uint(i) as f64),
            CastOp::FpExt | CastOp::FpTrunc => out.set_float(i, src.get_float(i)),
            CastOp::Bitcast => unreachable!(),
        }
    }
    Ok(out)
}

/// Per-lane choice when `cond` has as many lanes as the operands,
/// whole-value choice when `cond` is scalar.
pub fn select(cond: &TypedValue, if_true: &TypedValue, if_false: &TypedValue) -> Result<TypedValue, ExecutionError> {
    same_shape(if_true, if_false)?;
    int_lanes(cond)?;
    if cond.num == 1 {
        return Ok(if cond.try_uint(0)? != 0 { if_true.clone() } else { if_false.clone() });
    }
    if cond.num != if_true.num {
        return Err(ExecutionError::Unsupported(format!(
            "select with {} condition lanes over {} value lanes",
            cond.num, if_true.num
        )));
    }
    let mut out = if_false.clone();
    for i in 0..cond.num {
        if cond.get_uint(i) != 0 {
            let range = i * out.size..(i + 1) * out.size;
            out.data[range.clone()].copy_from_slice(&if_true.data[range]);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_ops_wrap_at_lane_width() {
        let a = TypedValue::from_u32(u32::MAX);
        let b = TypedValue::from_u32(2);
        assert_eq!(binary(BinaryOp::Add, &a, &b).unwrap().get_uint(0), 1);
        assert_eq!(binary(BinaryOp::SDiv, &a, &b).unwrap().get_sint(0), 0);
        assert_eq!(binary(BinaryOp::AShr, &a, &b).unwrap().get_sint(0), -1);
        assert_eq!(binary(BinaryOp::LShr, &a, &b).unwrap().get_uint(0), 0x3fff_ffff);
        assert_eq!(binary(BinaryOp::SMin, &a, &b).unwrap().get_sint(0), -1);
        assert_eq!(binary(BinaryOp::UMin, &a, &b).unwrap().get_uint(0), 2);
    }

    #[test]
    fn division_by_zero_faults() {
        let a = TypedValue::from_u32(4);
        let zero = TypedValue::from_u32(0);
        assert_eq!(binary(BinaryOp::URem, &a, &zero), Err(ExecutionError::DivisionByZero));
    }

    #[test]
    fn vector_lanes_are_independent() {
        let a = TypedValue::from_f32_lanes(&[1.0, 2.0, 3.0, 4.0]);
        let b = TypedValue::from_f32_lanes(&[0.5, 0.5, 0.5, 0.5]);
        let sum = binary(BinaryOp::FMul, &a, &b).unwrap();
        assert_eq!(sum, TypedValue::from_f32_lanes(&[0.5, 1.0, 1.5, 2.0]));
        let lt = compare(Predicate::FLt, &b, &a).unwrap();
        assert_eq!(lt.data, vec![1, 1, 1, 1]);
    }

    #[test]
    fn mismatched_shapes_are_unsupported() {
        let a = TypedValue::from_u32(1);
        let b = TypedValue::from_u64(1);
        assert!(matches!(binary(BinaryOp::Add, &a, &b), Err(ExecutionError::Unsupported(_))));
    }

    #[test]
    fn casts() {
        let v = TypedValue::from_i32(-3);
        assert_eq!(cast(CastOp::SExt, &v, &Type::Int(64)).unwrap().get_sint(0), -3);
        assert_eq!(cast(CastOp::ZExt, &v, &Type::Int(64)).unwrap().get_uint(0), 0xffff_fffd);
        assert_eq!(cast(CastOp::SiToFp, &v, &Type::Float).unwrap().get_float(0), -3.0);
        assert_eq!(cast(CastOp::Trunc, &v, &Type::Int(8)).unwrap().get_uint(0), 0xfd);
        let f = TypedValue::from_f32(7.9);
        assert_eq!(cast(CastOp::FpToSi, &f, &Type::i32()).unwrap().get_sint(0), 7);
        let bits = cast(CastOp::Bitcast, &TypedValue::from_f32(1.0), &Type::i32()).unwrap();
        assert_eq!(bits.get_uint(0), 0x3f80_0000);
    }

    #[test]
    fn select_by_lane_or_whole() {
        let t = TypedValue::from_u32_lanes(&[1, 2]);
        let f = TypedValue::from_u32_lanes(&[3, 4]);
        let lanes = TypedValue::from_bytes(1, 2, vec![0, 1]);
        assert_eq!(select(&lanes, &t, &f).unwrap(), TypedValue::from_u32_lanes(&[3, 2]));
        assert_eq!(select(&TypedValue::from_u8(1), &t, &f).unwrap(), t);
    }
}
