//! Ed25519 signing for the `client_ed25519` plugin
//!
//! Field elements are sixteen signed 16-bit limbs in radix 2^16, points use
//! extended coordinates (X, Y, Z, T). The secret is an arbitrary-length byte
//! string hashed with SHA-512, so a 32-byte secret signs exactly like RFC 8032.

use sha2::{Digest, Sha512};

type Gf = [i64; 16];
type Point = [Gf; 4];

const GF0: Gf = [0; 16];
const GF1: Gf = [1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];

/// 2 * d
const D2: Gf = [
    0xf159, 0x26b2, 0x9b94, 0xebd6, 0xb156, 0x8283, 0x149a, 0x00e0, 0xd130, 0xeef3, 0x80f2, 0x198e,
    0xfce7, 0x56df, 0xd9dc, 0x2406,
];

/// Base point x
const X: Gf = [
    0xd51a, 0x8f25, 0x2d60, 0xc956, 0xa7b2, 0x9525, 0xc760, 0x692c, 0xdc5c, 0xfdd6, 0xe231, 0xc0a4,
    0x53fe, 0xcd6e, 0x36d3, 0x2169,
];

/// Base point y
const Y: Gf = [
    0x6658, 0x6666, 0x6666, 0x6666, 0x6666, 0x6666, 0x6666, 0x6666, 0x6666, 0x6666, 0x6666, 0x6666,
    0x6666, 0x6666, 0x6666, 0x6666,
];

/// Group order, little-endian bytes
const L: [i64; 32] = [
    0xed, 0xd3, 0xf5, 0x5c, 0x1a, 0x63, 0x12, 0x58, 0xd6, 0x9c, 0xf7, 0xa2, 0xde, 0xf9, 0xde, 0x14,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x10,
];

pub const SIGNATURE_LENGTH: usize = 64;
pub const PUBLIC_KEY_LENGTH: usize = 32;

fn carry(o: &mut Gf) {
    for i in 0..16 {
        o[i] += 1 << 16;
        let c = o[i] >> 16;
        if i < 15 {
            o[i + 1] += c - 1;
        } else {
            o[0] += 38 * (c - 1);
        }
        o[i] -= c << 16;
    }
}

/// Constant-time swap of `p` and `q` when `b == 1`
fn select(p: &mut Gf, q: &mut Gf, b: i64) {
    let mask = !(b - 1);
    for i in 0..16 {
        let t = mask & (p[i] ^ q[i]);
        p[i] ^= t;
        q[i] ^= t;
    }
}

fn pack_field(n: &Gf) -> [u8; 32] {
    let mut t = *n;
    carry(&mut t);
    carry(&mut t);
    carry(&mut t);

    let mut m = GF0;
    for _ in 0..2 {
        m[0] = t[0] - 0xffed;
        for i in 1..15 {
            m[i] = t[i] - 0xffff - ((m[i - 1] >> 16) & 1);
            m[i - 1] &= 0xffff;
        }
        m[15] = t[15] - 0x7fff - ((m[14] >> 16) & 1);
        let b = (m[15] >> 16) & 1;
        m[14] &= 0xffff;
        select(&mut t, &mut m, 1 - b);
    }

    let mut out = [0u8; 32];
    for i in 0..16 {
        out[2 * i] = (t[i] & 0xff) as u8;
        out[2 * i + 1] = ((t[i] >> 8) & 0xff) as u8;
    }
    out
}

fn parity(a: &Gf) -> u8 {
    pack_field(a)[0] & 1
}

fn add_field(a: &Gf, b: &Gf) -> Gf {
    let mut o = GF0;
    for i in 0..16 {
        o[i] = a[i] + b[i];
    }
    o
}

fn sub_field(a: &Gf, b: &Gf) -> Gf {
    let mut o = GF0;
    for i in 0..16 {
        o[i] = a[i] - b[i];
    }
    o
}

fn mul_field(a: &Gf, b: &Gf) -> Gf {
    let mut t = [0i64; 31];
    for i in 0..16 {
        for j in 0..16 {
            t[i + j] += a[i] * b[j];
        }
    }
    for i in 0..15 {
        t[i] += 38 * t[i + 16];
    }
    let mut o = GF0;
    o.copy_from_slice(&t[..16]);
    carry(&mut o);
    carry(&mut o);
    o
}

fn square_field(a: &Gf) -> Gf {
    mul_field(a, a)
}

/// a^(p-2)
fn invert_field(i: &Gf) -> Gf {
    let mut c = *i;
    for a in (0..=253).rev() {
        c = square_field(&c);
        if a != 2 && a != 4 {
            c = mul_field(&c, i);
        }
    }
    c
}

fn add_point(p: &mut Point, q: &Point) {
    let a = mul_field(&sub_field(&p[1], &p[0]), &sub_field(&q[1], &q[0]));
    let b = mul_field(&add_field(&p[0], &p[1]), &add_field(&q[0], &q[1]));
    let c = mul_field(&mul_field(&p[3], &q[3]), &D2);
    let d = mul_field(&p[2], &q[2]);
    let d = add_field(&d, &d);
    let e = sub_field(&b, &a);
    let f = sub_field(&d, &c);
    let g = add_field(&d, &c);
    let h = add_field(&b, &a);

    p[0] = mul_field(&e, &f);
    p[1] = mul_field(&h, &g);
    p[2] = mul_field(&g, &f);
    p[3] = mul_field(&e, &h);
}

fn swap_points(p: &mut Point, q: &mut Point, b: i64) {
    for i in 0..4 {
        select(&mut p[i], &mut q[i], b);
    }
}

fn pack_point(p: &Point) -> [u8; 32] {
    let zi = invert_field(&p[2]);
    let tx = mul_field(&p[0], &zi);
    let ty = mul_field(&p[1], &zi);
    let mut out = pack_field(&ty);
    out[31] ^= parity(&tx) << 7;
    out
}

fn scalar_mult(q: &Point, s: &[u8]) -> Point {
    let mut p: Point = [GF0, GF1, GF1, GF0];
    let mut q = *q;
    for i in (0..256).rev() {
        let b = i64::from((s[i / 8] >> (i & 7)) & 1);
        swap_points(&mut p, &mut q, b);
        let p_copy = p;
        add_point(&mut q, &p_copy);
        add_point(&mut p, &p_copy);
        swap_points(&mut p, &mut q, b);
    }
    p
}

fn scalar_base(s: &[u8]) -> Point {
    let base: Point = [X, Y, GF1, mul_field(&X, &Y)];
    scalar_mult(&base, s)
}

/// Reduce a 512-bit little-endian value modulo the group order
fn mod_l(x: &mut [i64; 64]) -> [u8; 32] {
    for i in (32..64).rev() {
        let mut c = 0;
        let mut j = i - 32;
        while j < i - 12 {
            x[j] += c - 16 * x[i] * L[j - (i - 32)];
            c = (x[j] + 128) >> 8;
            x[j] -= c << 8;
            j += 1;
        }
        x[j] += c;
        x[i] = 0;
    }

    let mut c = 0;
    for j in 0..32 {
        x[j] += c - (x[31] >> 4) * L[j];
        c = x[j] >> 8;
        x[j] &= 255;
    }
    for j in 0..32 {
        x[j] -= c * L[j];
    }

    let mut r = [0u8; 32];
    for i in 0..32 {
        x[i + 1] += x[i] >> 8;
        r[i] = (x[i] & 255) as u8;
    }
    r
}

fn reduce(hash: &[u8]) -> [u8; 32] {
    let mut x = [0i64; 64];
    for (slot, byte) in x.iter_mut().zip(hash.iter()) {
        *slot = i64::from(*byte);
    }
    mod_l(&mut x)
}

fn expand_secret(secret: &[u8]) -> [u8; 64] {
    let mut az = [0u8; 64];
    az.copy_from_slice(&Sha512::digest(secret));
    az[0] &= 248;
    az[31] &= 127;
    az[31] |= 64;
    az
}

/// Public key for an arbitrary-length secret
pub fn public_key(secret: &[u8]) -> [u8; PUBLIC_KEY_LENGTH] {
    let az = expand_secret(secret);
    pack_point(&scalar_base(&az[..32]))
}

/// Deterministic signature of `message` keyed by `secret`
pub fn sign(message: &[u8], secret: &[u8]) -> [u8; SIGNATURE_LENGTH] {
    let az = expand_secret(secret);
    let public = pack_point(&scalar_base(&az[..32]));

    let mut hasher = Sha512::new();
    hasher.update(&az[32..]);
    hasher.update(message);
    let nonce = reduce(&hasher.finalize());

    let r = pack_point(&scalar_base(&nonce));

    let mut hasher = Sha512::new();
    hasher.update(r);
    hasher.update(public);
    hasher.update(message);
    let hram = reduce(&hasher.finalize());

    let mut x = [0i64; 64];
    for i in 0..32 {
        x[i] = i64::from(nonce[i]);
    }
    for i in 0..32 {
        for j in 0..32 {
            x[i + j] += i64::from(hram[i]) * i64::from(az[j]);
        }
    }
    let s = mod_l(&mut x);

    let mut signature = [0u8; SIGNATURE_LENGTH];
    signature[..32].copy_from_slice(&r);
    signature[32..].copy_from_slice(&s);
    signature
}
