/// Typed values.
/// Every argument, register and constant is carried as raw bytes plus an
/// element size and lane count. Bytes are in host order.
use crate::error::ExecutionError;

/// A value of `num` lanes, each `size` bytes wide.
///
/// Invariant: `data.len() == size * num`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TypedValue {
    pub size: usize,
    pub num: usize,
    pub data: Vec<u8>,
}

impl TypedValue {
    /// A zero-filled value.
    pub fn new(size: usize, num: usize) -> Self {
        TypedValue {
            size,
            num,
            data: vec![0u8; size * num],
        }
    }

    pub fn from_bytes(size: usize, num: usize, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), size * num);
        TypedValue { size, num, data }
    }

    pub fn from_u8(v: u8) -> Self {
        Self::from_bytes(1, 1, vec![v])
    }

    pub fn from_u32(v: u32) -> Self {
        Self::from_bytes(4, 1, v.to_ne_bytes().to_vec())
    }

    pub fn from_i32(v: i32) -> Self {
        Self::from_bytes(4, 1, v.to_ne_bytes().to_vec())
    }

    pub fn from_u64(v: u64) -> Self {
        Self::from_bytes(8, 1, v.to_ne_bytes().to_vec())
    }

    pub fn from_f32(v: f32) -> Self {
        Self::from_bytes(4, 1, v.to_ne_bytes().to_vec())
    }

    pub fn from_f64(v: f64) -> Self {
        Self::from_bytes(8, 1, v.to_ne_bytes().to_vec())
    }

    /// A pointer-sized value holding `address`.
    pub fn pointer(address: u64) -> Self {
        Self::from_u64(address)
    }

    /// A vector of 32-bit integers.
    pub fn from_u32_lanes(lanes: &[u32]) -> Self {
        let data = lanes.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self::from_bytes(4, lanes.len(), data)
    }

    /// A vector of 32-bit floats.
    pub fn from_f32_lanes(lanes: &[f32]) -> Self {
        let data = lanes.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self::from_bytes(4, lanes.len(), data)
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn lane(&self, i: usize) -> &[u8] {
        &self.data[i * self.size..(i + 1) * self.size]
    }

    /// Lane `i` zero-extended to 64 bits.
    ///
    /// Lanes must be 1, 2, 4 or 8 bytes wide. Values produced by a running
    /// program go through [`TypedValue::try_uint`] instead.
    pub fn get_uint(&self, i: usize) -> u64 {
        let b = self.lane(i);
        match self.size {
            1 => b[0] as u64,
            2 => u16::from_ne_bytes([b[0], b[1]]) as u64,
            4 => u32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as u64,
            8 => u64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
            n => panic!("no integer interpretation for {n}-byte lanes"),
        }
    }

    /// Lane `i` sign-extended to 64 bits.
    pub fn get_sint(&self, i: usize) -> i64 {
        let raw = self.get_uint(i);
        let bits = self.size * 8;
        if bits == 64 {
            raw as i64
        } else {
            let shift = 64 - bits;
            ((raw << shift) as i64) >> shift
        }
    }

    /// Store the low `size` bytes of `v` into lane `i`.
    pub fn set_uint(&mut self, i: usize, v: u64) {
        let size = self.size;
        let dst = &mut self.data[i * size..(i + 1) * size];
        match size {
            1 => dst.copy_from_slice(&(v as u8).to_ne_bytes()),
            2 => dst.copy_from_slice(&(v as u16).to_ne_bytes()),
            4 => dst.copy_from_slice(&(v as u32).to_ne_bytes()),
            8 => dst.copy_from_slice(&v.to_ne_bytes()),
            n => panic!("no integer interpretation for {n}-byte lanes"),
        }
    }

    /// Lane `i` as a float (4-byte lanes are `f32`, 8-byte lanes `f64`).
    pub fn get_float(&self, i: usize) -> f64 {
        match self.size {
            4 => f32::from_bits(self.get_uint(i) as u32) as f64,
            8 => f64::from_bits(self.get_uint(i)),
            n => panic!("no float interpretation for {n}-byte lanes"),
        }
    }

    pub fn set_float(&mut self, i: usize, v: f64) {
        match self.size {
            4 => self.set_uint(i, (v as f32).to_bits() as u64),
            8 => self.set_uint(i, v.to_bits()),
            n => panic!("no float interpretation for {n}-byte lanes"),
        }
    }

    /// First lane read as an address.
    pub fn as_pointer(&self) -> u64 {
        self.get_uint(0)
    }

    /// Checked form of [`TypedValue::get_uint`]: a missing lane or a lane
    /// width with no integer reading is an unsupported operation.
    pub fn try_uint(&self, i: usize) -> Result<u64, ExecutionError> {
        let present = i < self.num && (i + 1) * self.size <= self.data.len();
        match self.size {
            1 | 2 | 4 | 8 if present => Ok(self.get_uint(i)),
            n => Err(ExecutionError::Unsupported(format!(
                "integer read of lane {i} of a {}x{n}-byte value",
                self.num
            ))),
        }
    }

    pub fn try_sint(&self, i: usize) -> Result<i64, ExecutionError> {
        self.try_uint(i)?;
        Ok(self.get_sint(i))
    }

    pub fn try_pointer(&self) -> Result<u64, ExecutionError> {
        self.try_uint(0)
    }

    /// Reinterpret the same bytes with a different lane shape.
    pub fn reshaped(mut self, size: usize, num: usize) -> Self {
        debug_assert_eq!(self.data.len(), size * num);
        self.size = size;
        self.num = num;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_matches_shape() {
        let v = TypedValue::new(4, 3);
        assert_eq!(v.byte_len(), 12);
        assert_eq!(TypedValue::from_f32_lanes(&[1.0, 2.0]).byte_len(), 8);
    }

    #[test]
    fn sign_extension_follows_lane_width() {
        let mut v = TypedValue::new(1, 1);
        v.set_uint(0, 0xff);
        assert_eq!(v.get_uint(0), 0xff);
        assert_eq!(v.get_sint(0), -1);

        let v = TypedValue::from_i32(-5);
        assert_eq!(v.get_sint(0), -5);
        assert_eq!(v.get_uint(0), 0xffff_fffb);
    }

    #[test]
    fn set_uint_truncates() {
        let mut v = TypedValue::new(2, 2);
        v.set_uint(1, 0x1_2345);
        assert_eq!(v.get_uint(1), 0x2345);
        assert_eq!(v.get_uint(0), 0);
    }

    #[test]
    fn float_lanes() {
        let mut v = TypedValue::from_f32_lanes(&[1.5, -2.0]);
        assert_eq!(v.get_float(1), -2.0);
        v.set_float(0, 0.25);
        assert_eq!(v.get_float(0), 0.25);
        assert_eq!(TypedValue::from_f64(3.0).get_float(0), 3.0);
    }

    #[test]
    fn checked_reads_reject_odd_widths() {
        let odd = TypedValue::new(3, 1);
        assert!(matches!(odd.try_uint(0), Err(ExecutionError::Unsupported(_))));
        assert!(odd.try_pointer().is_err());
        assert!(TypedValue::new(4, 0).try_uint(0).is_err());
        assert_eq!(TypedValue::from_i32(-2).try_sint(0), Ok(-2));
        assert_eq!(TypedValue::from_u32_lanes(&[1, 7]).try_uint(1), Ok(7));
    }

    #[test]
    fn reshape_keeps_bytes() {
        let v = TypedValue::from_bytes(16, 1, (0u8..16).collect()).reshaped(4, 4);
        assert_eq!(v.num, 4);
        assert_eq!(v.lane(3), &[12, 13, 14, 15]);
    }
}
