use crate::error::{CollectiveError, Result};
use crate::transport::ReduceOp;
use crate::types::ElementType;

/// Elementwise-reduces `buffers` (each the same length, encoding `count`
/// elements of `element_type`) and returns the reduced bytes. Used by the
/// loopback device/host transports to compute real collective results so
/// integration tests can assert on actual numbers.
pub fn reduce_bytes(
    buffers: &[Vec<u8>],
    count: usize,
    element_type: ElementType,
    op: ReduceOp,
) -> Result<Vec<u8>> {
    match element_type {
        ElementType::Int32 => Ok(reduce_i32(buffers, count, op)),
        ElementType::Int64 => Ok(reduce_i64(buffers, count, op)),
        ElementType::Float32 => Ok(reduce_f32(buffers, count, op)),
        ElementType::Float64 => Ok(reduce_f64(buffers, count, op)),
        ElementType::Float16 => Err(CollectiveError::unsupported_type(
            "FLOAT16 (loopback test transport cannot reduce half-precision)",
        )),
    }
}

macro_rules! reduce_impl {
    ($name:ident, $ty:ty, $size:expr) => {
        fn $name(buffers: &[Vec<u8>], count: usize, op: ReduceOp) -> Vec<u8> {
            let mut out = vec![<$ty>::default(); count];
            for buf in buffers {
                for (i, slot) in out.iter_mut().enumerate() {
                    let bytes: [u8; $size] = buf[i * $size..(i + 1) * $size].try_into().unwrap();
                    *slot += <$ty>::from_le_bytes(bytes);
                }
            }
            if op == ReduceOp::Mean {
                let n = buffers.len() as $ty;
                for slot in out.iter_mut() {
                    *slot /= n;
                }
            }
            out.into_iter().flat_map(|v| v.to_le_bytes()).collect()
        }
    };
}

reduce_impl!(reduce_i32, i32, 4);
reduce_impl!(reduce_i64, i64, 8);
reduce_impl!(reduce_f32, f32, 4);
reduce_impl!(reduce_f64, f64, 8);
