//! `long double` storage formats
//!
//! x86 targets use the x87 80-bit extended format (padded to 12 or 16
//! bytes); the 128-bit targets use IEEE binary128. Host numbers are `f64`,
//! so stores are exact and loads report whether the value survived.

/// Native layout of the host's `long double` when it is wider than `double`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LongDoubleFormat {
    X87,
    Binary128,
}

impl LongDoubleFormat {
    pub(crate) const fn host() -> Self {
        if cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
            Self::X87
        } else {
            Self::Binary128
        }
    }

    /// Bytes the format actually occupies
    pub(crate) const fn width(self) -> usize {
        match self {
            Self::X87 => 10,
            Self::Binary128 => 16,
        }
    }

    /// Encode `f`; `dst` must hold `width()` bytes
    pub(crate) fn encode(self, f: f64, dst: &mut [u8]) {
        match self {
            Self::X87 => dst[..10].copy_from_slice(&f64_to_x87(f)),
            Self::Binary128 => dst[..16].copy_from_slice(&f64_to_binary128(f).to_ne_bytes()),
        }
    }

    /// Decode to the nearest `f64`, and whether that was exact
    pub(crate) fn decode(self, src: &[u8]) -> (f64, bool) {
        match self {
            Self::X87 => {
                let mut raw = [0u8; 10];
                raw.copy_from_slice(&src[..10]);
                x87_to_f64(raw)
            }
            Self::Binary128 => {
                let mut raw = [0u8; 16];
                raw.copy_from_slice(&src[..16]);
                binary128_to_f64(u128::from_ne_bytes(raw))
            }
        }
    }
}

const F64_FRAC: u64 = (1 << 52) - 1;

/// `x * 2^exp` without overflowing intermediates
fn scale(mut x: f64, mut exp: i32) -> f64 {
    let two_1023 = f64::from_bits(0x7FE0_0000_0000_0000);
    let two_m1022 = f64::from_bits(0x0010_0000_0000_0000);
    while exp > 1023 {
        x *= two_1023;
        exp -= 1023;
        if x.is_infinite() {
            return x;
        }
    }
    while exp < -1022 {
        x *= two_m1022;
        exp += 1022;
        if x == 0.0 {
            return x;
        }
    }
    x * f64::from_bits(((exp + 1023) as u64) << 52)
}

/// Sign, unbiased exponent of the leading bit, and the significand with
/// its leading bit at bit 63. `None` for zeros.
fn unpack_finite(f: f64) -> Option<(bool, i32, u64)> {
    let bits = f.to_bits();
    let sign = bits >> 63 != 0;
    let exp = ((bits >> 52) & 0x7FF) as i32;
    let frac = bits & F64_FRAC;
    match (exp, frac) {
        (0, 0) => None,
        (0, _) => {
            let lz = frac.leading_zeros() as i32;
            Some((sign, -1074 + 63 - lz, frac << lz))
        }
        _ => Some((sign, exp - 1023, (1 << 63) | (frac << 11))),
    }
}

fn f64_to_x87(f: f64) -> [u8; 10] {
    let sign = (f.is_sign_negative() as u16) << 15;
    let (se, mant) = if f.is_nan() {
        (0x7FFF, (3 << 62) | ((f.to_bits() & F64_FRAC) << 11))
    } else if f.is_infinite() {
        (0x7FFF, 1 << 63)
    } else {
        match unpack_finite(f) {
            None => (0, 0),
            Some((_, exp, mant)) => ((exp + 16383) as u16, mant),
        }
    };
    let mut out = [0u8; 10];
    out[..8].copy_from_slice(&mant.to_le_bytes());
    out[8..].copy_from_slice(&(sign | se).to_le_bytes());
    out
}

fn x87_to_f64(raw: [u8; 10]) -> (f64, bool) {
    let mut m = [0u8; 8];
    m.copy_from_slice(&raw[..8]);
    let mant = u64::from_le_bytes(m);
    let se = u16::from_le_bytes([raw[8], raw[9]]);
    let negative = se >> 15 != 0;
    let exp = (se & 0x7FFF) as i32;
    let signed = |x: f64| if negative { -x } else { x };

    if exp == 0x7FFF {
        return if mant << 1 == 0 {
            (signed(f64::INFINITY), true)
        } else {
            (f64::NAN, true)
        };
    }
    if mant == 0 {
        return (signed(0.0), true);
    }
    let lz = mant.leading_zeros() as i32;
    let top = mant << lz;
    let lead = exp.max(1) - 16383 - lz;
    let (value, exact) = round_to_f64(top as u128, 63, lead);
    (signed(value), exact)
}

fn f64_to_binary128(f: f64) -> u128 {
    let sign = (f.is_sign_negative() as u128) << 127;
    let body = if f.is_nan() {
        (0x7FFFu128 << 112) | (1 << 111) | (((f.to_bits() & F64_FRAC) as u128) << 60)
    } else if f.is_infinite() {
        0x7FFFu128 << 112
    } else {
        match unpack_finite(f) {
            None => 0,
            Some((_, exp, mant)) => {
                let frac = ((mant << 1) as u128) << 48;
                (((exp + 16383) as u128) << 112) | frac
            }
        }
    };
    sign | body
}

fn binary128_to_f64(bits: u128) -> (f64, bool) {
    let negative = bits >> 127 != 0;
    let exp = ((bits >> 112) & 0x7FFF) as i32;
    let frac = bits & ((1u128 << 112) - 1);
    let signed = |x: f64| if negative { -x } else { x };

    if exp == 0x7FFF {
        return if frac == 0 {
            (signed(f64::INFINITY), true)
        } else {
            (f64::NAN, true)
        };
    }
    if exp == 0 && frac == 0 {
        return (signed(0.0), true);
    }
    let (mant, lead) = if exp == 0 {
        let lz = frac.leading_zeros() as i32 - 15;
        (frac << lz, 1 - 16383 - lz)
    } else {
        ((1u128 << 112) | frac, exp - 16383)
    };
    let (value, exact) = round_to_f64(mant, 112, lead);
    (signed(value), exact)
}

/// Round a significand whose leading bit sits at `top_bit` to 53 bits,
/// then scale so the leading bit has weight `2^lead`
fn round_to_f64(mant: u128, top_bit: u32, lead: i32) -> (f64, bool) {
    let drop = top_bit - 52;
    let mut q = mant >> drop;
    let rem = mant & ((1u128 << drop) - 1);
    let half = 1u128 << (drop - 1);
    if rem > half || (rem == half && q & 1 == 1) {
        q += 1;
    }
    let value = scale(q as f64, lead - 52);
    let exact = rem == 0 && value.is_finite() && {
        // subnormal results may lose low bits in the final scaling
        let back = unpack_finite(value).map(|(_, e, m)| (e, m));
        let want = (mant << (127 - top_bit)) >> 64;
        back == Some((lead, want as u64))
    };
    (value, exact)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(format: LongDoubleFormat, f: f64) -> (f64, bool) {
        let mut buf = [0u8; 16];
        format.encode(f, &mut buf);
        format.decode(&buf)
    }

    #[test]
    fn test_x87_known_encodings() {
        let one = f64_to_x87(1.0);
        assert_eq!(&one[..8], &(1u64 << 63).to_le_bytes());
        assert_eq!(u16::from_le_bytes([one[8], one[9]]), 0x3FFF);
        let minus_two = f64_to_x87(-2.0);
        assert_eq!(u16::from_le_bytes([minus_two[8], minus_two[9]]), 0xC000);
    }

    #[test]
    fn test_binary128_known_encodings() {
        assert_eq!(f64_to_binary128(1.0), 0x3FFFu128 << 112);
        assert_eq!(f64_to_binary128(-0.5), (1u128 << 127) | (0x3FFEu128 << 112));
    }

    #[test]
    fn test_exact_roundtrips() {
        let samples = [
            0.0,
            -0.0,
            1.5,
            -3.25,
            f64::MAX,
            f64::MIN_POSITIVE,
            5e-324,
            1e-310,
            std::f64::consts::PI,
            f64::INFINITY,
            f64::NEG_INFINITY,
        ];
        for format in [LongDoubleFormat::X87, LongDoubleFormat::Binary128] {
            for f in samples {
                let (back, exact) = roundtrip(format, f);
                assert_eq!(back.to_bits(), f.to_bits(), "{:?} {}", format, f);
                assert!(exact, "{:?} {}", format, f);
            }
            assert!(roundtrip(format, f64::NAN).0.is_nan());
        }
    }

    #[test]
    fn test_extra_precision_is_reported() {
        // 1 + 2^-60 needs more than 53 significand bits
        let mut raw = f64_to_x87(1.0);
        raw[0] = 0b1000;
        let (value, exact) = x87_to_f64(raw);
        assert_eq!(value, 1.0);
        assert!(!exact);

        let (value, exact) = binary128_to_f64((0x3FFFu128 << 112) | 1);
        assert_eq!(value, 1.0);
        assert!(!exact);
    }
}
