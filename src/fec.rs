//! Forward-error-correction codec sitting between the iobuffer and the
//! volume layer.
//!
//! A frame is K source packets of 4096 bytes (64 KiB of payload). The
//! encoder expands it to N = K + ecclevel packets using a systematic
//! Reed-Solomon code over GF(2^8): packets 0..K are the sources verbatim,
//! packets K..N carry parity. Every stored packet is suffixed with its
//! 16-byte MD5 so the decoder can tell good packets from corrupted ones
//! without trusting any surrounding framing. Any K packets whose MD5
//! verifies reconstruct the frame exactly.
//!
//! The generator matrix is a Vandermonde matrix normalized so its top K×K
//! block is the identity; any K of its rows stay linearly independent,
//! which is what makes "any K packets suffice" true.

use md5::{Digest, Md5};
use std::sync::OnceLock;

use crate::error::{FsaError, FsaResult};
use crate::options::{ECC_MAX, ECC_MIN};

/// Bytes of payload in one FEC packet.
pub const FEC_PACKET_SIZE: usize = 4096;
/// Source packets per frame.
pub const FEC_K: usize = 16;
/// MD5 trailer appended to each stored packet.
pub const FEC_MD5_LEN: usize = 16;
/// On-disk size of one packet.
pub const FEC_STORED_PACKET_SIZE: usize = FEC_PACKET_SIZE + FEC_MD5_LEN;
/// Raw payload bytes per frame (the iobuffer block size).
pub const FRAME_PAYLOAD_SIZE: usize = FEC_K * FEC_PACKET_SIZE;
/// Largest possible on-disk frame (N = K + ECC_MAX).
pub const MAX_ENCODED_FRAME_SIZE: usize = (FEC_K + ECC_MAX as usize) * FEC_STORED_PACKET_SIZE;

// ── GF(2^8) arithmetic ───────────────────────────────────────────────────────

// primitive polynomial x^8 + x^4 + x^3 + x^2 + 1
const GF_POLY: u16 = 0x11D;

struct GfTables {
    exp: [u8; 512],
    log: [u8; 256],
}

fn gf() -> &'static GfTables {
    static TABLES: OnceLock<GfTables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];
        let mut x: u16 = 1;
        for i in 0..255 {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= GF_POLY;
            }
        }
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }
        GfTables { exp, log }
    })
}

#[inline]
fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = gf();
    t.exp[t.log[a as usize] as usize + t.log[b as usize] as usize]
}

#[inline]
fn gf_inv(a: u8) -> u8 {
    let t = gf();
    t.exp[255 - t.log[a as usize] as usize]
}

#[inline]
fn gf_pow(base: u8, mut e: usize) -> u8 {
    let mut acc = 1u8;
    let mut b = base;
    while e > 0 {
        if e & 1 == 1 {
            acc = gf_mul(acc, b);
        }
        b = gf_mul(b, b);
        e >>= 1;
    }
    acc
}

// ── Matrix helpers (row-major, dim×dim or rows×cols) ────────────────────────

/// Invert a square matrix in place with Gauss-Jordan elimination.
/// A singular matrix reports Corrupt; submatrices of the systematic
/// Vandermonde generator are always invertible.
fn invert_matrix(m: &mut [u8], dim: usize) -> FsaResult<Vec<u8>> {
    let mut inv = vec![0u8; dim * dim];
    for i in 0..dim {
        inv[i * dim + i] = 1;
    }

    for col in 0..dim {
        // find a pivot
        let pivot_row = (col..dim)
            .find(|&r| m[r * dim + col] != 0)
            .ok_or_else(|| FsaError::Corrupt("singular FEC matrix".into()))?;
        if pivot_row != col {
            for j in 0..dim {
                m.swap(col * dim + j, pivot_row * dim + j);
                inv.swap(col * dim + j, pivot_row * dim + j);
            }
        }
        let pivot = m[col * dim + col];
        let pivot_inv = gf_inv(pivot);
        for j in 0..dim {
            m[col * dim + j] = gf_mul(m[col * dim + j], pivot_inv);
            inv[col * dim + j] = gf_mul(inv[col * dim + j], pivot_inv);
        }
        for r in 0..dim {
            if r == col {
                continue;
            }
            let factor = m[r * dim + col];
            if factor == 0 {
                continue;
            }
            for j in 0..dim {
                m[r * dim + j] ^= gf_mul(factor, m[col * dim + j]);
                inv[r * dim + j] ^= gf_mul(factor, inv[col * dim + j]);
            }
        }
    }
    Ok(inv)
}

/// Build the systematic N×K generator: Vandermonde rows over distinct
/// nodes, multiplied by the inverse of its own top K×K block.
fn build_generator(k: usize, n: usize) -> Vec<u8> {
    let alpha = gf().exp[1]; // the generator element α = x

    // plain Vandermonde: v[i][j] = (α^i)^j, nodes distinct for i < 255
    let mut vand = vec![0u8; n * k];
    for (i, row) in vand.chunks_mut(k).enumerate() {
        let node = gf_pow(alpha, i);
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = gf_pow(node, j);
        }
    }

    let mut top = vand[..k * k].to_vec();
    let top_inv = invert_matrix(&mut top, k).expect("Vandermonde top block is invertible");

    // gen = vand × top_inv; the first K rows become the identity
    let mut gen = vec![0u8; n * k];
    for i in 0..n {
        for j in 0..k {
            let mut acc = 0u8;
            for t in 0..k {
                acc ^= gf_mul(vand[i * k + t], top_inv[t * k + j]);
            }
            gen[i * k + j] = acc;
        }
    }
    gen
}

// ── Codec ────────────────────────────────────────────────────────────────────

pub struct FecCodec {
    k: usize,
    n: usize,
    /// n×k generator, row-major. Top k rows are the identity.
    gen: Vec<u8>,
}

/// Result of decoding one frame.
pub struct DecodedFrame {
    pub payload: Vec<u8>,
    /// Stored packets whose MD5 did not verify.
    pub bad_packets: usize,
}

impl FecCodec {
    pub fn new(ecclevel: u32) -> FsaResult<FecCodec> {
        if !(ECC_MIN..=ECC_MAX).contains(&ecclevel) {
            return Err(FsaError::InvalidArg(format!(
                "ecc level {ecclevel} out of range {ECC_MIN}..={ECC_MAX}"
            )));
        }
        let k = FEC_K;
        let n = k + ecclevel as usize;
        Ok(FecCodec {
            k,
            n,
            gen: build_generator(k, n),
        })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Size of one encoded frame on disk.
    pub fn encoded_size(&self) -> usize {
        self.n * FEC_STORED_PACKET_SIZE
    }

    /// Encode one frame payload (exactly K×4096 bytes) into N stored
    /// packets, each carrying its MD5 trailer.
    pub fn encode_frame(&self, payload: &[u8]) -> FsaResult<Vec<u8>> {
        if payload.len() != FRAME_PAYLOAD_SIZE {
            return Err(FsaError::InvalidArg(format!(
                "FEC frame payload is {} bytes, expected {FRAME_PAYLOAD_SIZE}",
                payload.len()
            )));
        }

        let mut out = Vec::with_capacity(self.encoded_size());
        let mut parity = vec![0u8; FEC_PACKET_SIZE];

        for i in 0..self.n {
            let packet: &[u8] = if i < self.k {
                &payload[i * FEC_PACKET_SIZE..(i + 1) * FEC_PACKET_SIZE]
            } else {
                parity.fill(0);
                let row = &self.gen[i * self.k..(i + 1) * self.k];
                for (j, &coef) in row.iter().enumerate() {
                    if coef == 0 {
                        continue;
                    }
                    let src = &payload[j * FEC_PACKET_SIZE..(j + 1) * FEC_PACKET_SIZE];
                    for (p, &s) in parity.iter_mut().zip(src.iter()) {
                        *p ^= gf_mul(coef, s);
                    }
                }
                &parity
            };
            out.extend_from_slice(packet);
            let digest: [u8; 16] = Md5::digest(packet).into();
            out.extend_from_slice(&digest);
        }
        Ok(out)
    }

    /// Decode one stored frame (N packets + trailers) back into the K×4096
    /// payload. Packets failing their MD5 are ignored; fewer than K good
    /// packets is unrecoverable.
    pub fn decode_frame(&self, stored: &[u8]) -> FsaResult<DecodedFrame> {
        if stored.len() != self.encoded_size() {
            return Err(FsaError::InvalidArg(format!(
                "encoded FEC frame is {} bytes, expected {}",
                stored.len(),
                self.encoded_size()
            )));
        }

        // MD5-filter: keep the first K packets that verify
        let mut good_idx: Vec<usize> = Vec::with_capacity(self.k);
        let mut bad = 0usize;
        for i in 0..self.n {
            if good_idx.len() == self.k {
                break;
            }
            let base = i * FEC_STORED_PACKET_SIZE;
            let packet = &stored[base..base + FEC_PACKET_SIZE];
            let trailer = &stored[base + FEC_PACKET_SIZE..base + FEC_STORED_PACKET_SIZE];
            let digest: [u8; 16] = Md5::digest(packet).into();
            if digest[..] == *trailer {
                good_idx.push(i);
            } else {
                bad += 1;
            }
        }

        if good_idx.len() < self.k {
            // count the rest of the bad packets for the report
            bad = self.n - good_idx.len();
            return Err(FsaError::Corrupt(format!(
                "FEC frame unrecoverable: {bad} bad packets out of {}",
                self.n
            )));
        }

        let packet_at =
            |i: usize| &stored[i * FEC_STORED_PACKET_SIZE..i * FEC_STORED_PACKET_SIZE + FEC_PACKET_SIZE];

        // fast path: all sources intact
        if good_idx.iter().enumerate().all(|(pos, &i)| pos == i) {
            let mut payload = Vec::with_capacity(FRAME_PAYLOAD_SIZE);
            for i in 0..self.k {
                payload.extend_from_slice(packet_at(i));
            }
            return Ok(DecodedFrame {
                payload,
                bad_packets: bad,
            });
        }

        // general path: invert the generator restricted to the chosen rows
        let mut sub = vec![0u8; self.k * self.k];
        for (r, &i) in good_idx.iter().enumerate() {
            sub[r * self.k..(r + 1) * self.k]
                .copy_from_slice(&self.gen[i * self.k..(i + 1) * self.k]);
        }
        let inv = invert_matrix(&mut sub, self.k)?;

        let mut payload = vec![0u8; FRAME_PAYLOAD_SIZE];
        for j in 0..self.k {
            // source j = Σ_r inv[j][r] · recv[r]
            let start = j * FEC_PACKET_SIZE;
            if good_idx.contains(&j) {
                // source packet j itself survived; take it verbatim
                payload[start..start + FEC_PACKET_SIZE].copy_from_slice(packet_at(j));
                continue;
            }
            let dst = &mut payload[start..start + FEC_PACKET_SIZE];
            for (r, &i) in good_idx.iter().enumerate() {
                let coef = inv[j * self.k + r];
                if coef == 0 {
                    continue;
                }
                let src = packet_at(i);
                for (d, &s) in dst.iter_mut().zip(src.iter()) {
                    *d ^= gf_mul(coef, s);
                }
            }
        }

        Ok(DecodedFrame {
            payload,
            bad_packets: bad,
        })
    }
}
