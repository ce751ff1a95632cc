//! GF(2^8) arithmetic over the polynomial `x^8 + x^4 + x^3 + x^2 + 1`
//! (`0x11D`), with generator 2.
//!
//! Addition is XOR.  Multiplication and division go through log/exp tables
//! that are built at compile time, so there is no runtime initialisation.

const POLY: u16 = 0x11D;

struct Tables {
    /// `exp[i] = 2^i`, doubled in length so `exp[log a + log b]` never needs
    /// a modulo.
    exp: [u8; 512],
    /// `log[a]` for `a != 0`; `log[0]` is unused.
    log: [u8; 256],
}

const fn build_tables() -> Tables {
    let mut exp = [0u8; 512];
    let mut log = [0u8; 256];
    let mut x: u16 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= POLY;
        }
        i += 1;
    }
    while i < 512 {
        exp[i] = exp[i - 255];
        i += 1;
    }
    Tables { exp, log }
}

static TABLES: Tables = build_tables();

#[inline]
pub fn add(a: u8, b: u8) -> u8 {
    a ^ b
}

#[inline]
pub fn mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    TABLES.exp[TABLES.log[a as usize] as usize + TABLES.log[b as usize] as usize]
}

/// Multiplicative inverse; `None` for zero.
#[inline]
pub fn inv(a: u8) -> Option<u8> {
    if a == 0 {
        return None;
    }
    Some(TABLES.exp[255 - TABLES.log[a as usize] as usize])
}

/// `a / b`; `None` when `b` is zero.
#[inline]
pub fn div(a: u8, b: u8) -> Option<u8> {
    inv(b).map(|b_inv| mul(a, b_inv))
}

/// `a^n`, with `0^0 == 1`.
pub fn pow(a: u8, n: usize) -> u8 {
    if n == 0 {
        return 1;
    }
    if a == 0 {
        return 0;
    }
    let log = TABLES.log[a as usize] as usize;
    TABLES.exp[(log * n) % 255]
}

/// `dst[i] ^= coef * src[i]` for every byte.
///
/// The two slices must have equal length; the shorter length wins otherwise.
pub fn mul_add_slice(dst: &mut [u8], src: &[u8], coef: u8) {
    match coef {
        0 => {}
        1 => {
            for (d, s) in dst.iter_mut().zip(src) {
                *d ^= *s;
            }
        }
        _ => {
            let log_coef = TABLES.log[coef as usize] as usize;
            for (d, s) in dst.iter_mut().zip(src) {
                if *s != 0 {
                    *d ^= TABLES.exp[log_coef + TABLES.log[*s as usize] as usize];
                }
            }
        }
    }
}
