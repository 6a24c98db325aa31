//! Tier-1 block coder: three-pass context modelling over bit planes,
//! driving the MQ coder (and the raw coder inside lazy segments).
//!
//! State is one 16-bit flags word per sample carrying the significance and
//! sign of the eight-neighbourhood plus the sample's own
//! significant/visited/refined marks; the flags array has a one-sample
//! apron so neighbour access never branches. The stripe-causal mode masks
//! the southern neighbourhood at read time on the last row of each 4-row
//! stripe.

use crate::coding_params::{
    CBLK_STY_LAZY, CBLK_STY_PTERM, CBLK_STY_RESET, CBLK_STY_SEGSYM, CBLK_STY_TERMALL,
    CBLK_STY_VSC, MAX_PASSES,
};
use crate::mq_coder::{MqDecoder, MqEncoder, RawDecoder, CTX_AGG, CTX_UNI};
use crate::tile::{CodeBlock, EncPass};

const SIG_NE: u16 = 0x0001;
const SIG_SE: u16 = 0x0002;
const SIG_SW: u16 = 0x0004;
const SIG_NW: u16 = 0x0008;
const SIG_N: u16 = 0x0010;
const SIG_E: u16 = 0x0020;
const SIG_S: u16 = 0x0040;
const SIG_W: u16 = 0x0080;
const SGN_N: u16 = 0x0100;
const SGN_E: u16 = 0x0200;
const SGN_S: u16 = 0x0400;
const SGN_W: u16 = 0x0800;
const SIG: u16 = 0x1000;
const REFINE: u16 = 0x2000;
const VISIT: u16 = 0x4000;

const SIG_OTH: u16 = SIG_N | SIG_NE | SIG_E | SIG_SE | SIG_S | SIG_SW | SIG_W | SIG_NW;
/// Bits a stripe-causal read must not see from the next stripe.
const VSC_MASK: u16 = !(SIG_S | SIG_SE | SIG_SW | SGN_S);

/// Fractional bits carried below the coded planes for distortion
/// estimation.
const NMSEDEC_FRACBITS: u32 = 6;
const NMSEDEC_MASK: u32 = (1 << 7) - 1;

const SIGN_BIT: u32 = 31;

type MqCtx = usize;

/// Zero-coding context (Table D.1) from the neighbourhood significance.
fn zc_context(f: u16, orient: u32) -> MqCtx {
    let h = u32::from(f & SIG_W != 0) + u32::from(f & SIG_E != 0);
    let v = u32::from(f & SIG_N != 0) + u32::from(f & SIG_S != 0);
    let d = u32::from(f & SIG_NW != 0)
        + u32::from(f & SIG_NE != 0)
        + u32::from(f & SIG_SW != 0)
        + u32::from(f & SIG_SE != 0);
    // The HL band reads its neighbourhood transposed.
    let (h, v) = if orient == 1 { (v, h) } else { (h, v) };
    let n = if orient == 3 {
        let hv = h + v;
        match (d, hv) {
            (0, 0) => 0,
            (0, 1) => 1,
            (0, _) => 2,
            (1, 0) => 3,
            (1, 1) => 4,
            (1, _) => 5,
            (2, 0) => 6,
            (2, _) => 7,
            _ => 8,
        }
    } else {
        match (h, v, d) {
            (0, 0, 0) => 0,
            (0, 0, 1) => 1,
            (0, 0, _) => 2,
            (0, 1, _) => 3,
            (0, _, _) => 4,
            (1, 0, 0) => 5,
            (1, 0, _) => 6,
            (1, _, _) => 7,
            _ => 8,
        }
    };
    n as MqCtx
}

/// Sign-coding context and sign predictor (Table D.3).
fn sc_context(f: u16) -> (MqCtx, u8) {
    let contrib = |sig: u16, sgn: u16| -> i32 {
        if f & sig != 0 {
            if f & sgn != 0 {
                -1
            } else {
                1
            }
        } else {
            0
        }
    };
    let hc = (contrib(SIG_E, SGN_E) + contrib(SIG_W, SGN_W)).clamp(-1, 1);
    let vc = (contrib(SIG_N, SGN_N) + contrib(SIG_S, SGN_S)).clamp(-1, 1);
    match (hc, vc) {
        (1, 1) => (13, 0),
        (1, 0) => (12, 0),
        (1, -1) => (11, 0),
        (0, 1) => (10, 0),
        (0, 0) => (9, 0),
        (0, -1) => (10, 1),
        (-1, 1) => (11, 1),
        (-1, 0) => (12, 1),
        (-1, -1) => (13, 1),
        _ => unreachable!(),
    }
}

/// Magnitude-refinement context (Table D.4).
fn mag_context(f: u16) -> MqCtx {
    if f & REFINE != 0 {
        16
    } else if f & SIG_OTH != 0 {
        15
    } else {
        14
    }
}

/// Normalized MSE decrease when a sample first becomes significant at
/// `bitpos`, in units of 1/8192 (half-bin reconstruction model).
fn nmsedec_sig(x: u32, bitpos: u32) -> i32 {
    let i = if bitpos > 0 {
        (x >> bitpos) & NMSEDEC_MASK
    } else {
        x & NMSEDEC_MASK
    };
    let t = i as f64 / 64.0;
    let u = t;
    let v = if bitpos > 0 { t - 1.5 } else { t - 1.0 };
    let d = ((u * u - v * v) * 64.0 + 0.5).floor() / 64.0 * 8192.0;
    (d as i32).max(0)
}

/// Normalized MSE decrease of one refinement bit at `bitpos`.
fn nmsedec_ref(x: u32, bitpos: u32) -> i32 {
    let i = if bitpos > 0 {
        (x >> bitpos) & NMSEDEC_MASK
    } else {
        x & NMSEDEC_MASK
    };
    let t = i as f64 / 64.0;
    let u = t - 1.0;
    let v = if i & 0x40 != 0 { t - 1.5 } else { t - 0.5 };
    let d = ((u * u - v * v) * 64.0 + 0.5).floor() / 64.0 * 8192.0;
    (d as i32).max(0)
}

/// Weighted distortion decrease of one whole pass.
#[allow(clippy::too_many_arguments)]
fn wmsedec(
    nmsedec: i32,
    level: u32,
    orient: u32,
    bpno: i32,
    qmfbid: u32,
    stepsize: f32,
    mct_norm: f64,
) -> f64 {
    let w2 = if qmfbid == 1 {
        crate::dwt::norm_53(level, orient)
    } else {
        crate::dwt::norm_97(level, orient)
    };
    let w = mct_norm * w2 * stepsize as f64 * f64::from(1u32 << bpno.max(0));
    w * w * nmsedec as f64 / 8192.0
}

/// Where the block coder reads its samples.
pub enum SampleSource<'a> {
    Int(&'a [i32]),
    Float(&'a [f32]),
}

/// Where post-decode writes its samples: the integer plane of a
/// reversible tile or the float plane of an irreversible one.
pub enum SampleSink<'a> {
    Int(&'a mut [i32]),
    Float(&'a mut [f32]),
}

/// Per-worker block coder with reusable scratch buffers.
pub struct T1Coder {
    w: usize,
    h: usize,
    stride: usize,
    flags: Vec<u16>,
    /// Encode side: magnitude with `NMSEDEC_FRACBITS` fractional bits and
    /// the sign in bit 31.
    enc_data: Vec<u32>,
    /// Decode side: signed magnitudes carrying one spare low bit.
    pub dec_data: Vec<i32>,
}

impl Default for T1Coder {
    fn default() -> Self {
        Self::new()
    }
}

impl T1Coder {
    pub fn new() -> Self {
        Self {
            w: 0,
            h: 0,
            stride: 0,
            flags: Vec::new(),
            enc_data: Vec::new(),
            dec_data: Vec::new(),
        }
    }

    fn init_buffers(&mut self, w: usize, h: usize) {
        self.w = w;
        self.h = h;
        self.stride = w + 2;
        let flag_len = self.stride * (h + 2);
        self.flags.clear();
        self.flags.resize(flag_len, 0);
        self.enc_data.clear();
        self.enc_data.resize(w * h, 0);
        self.dec_data.clear();
        self.dec_data.resize(w * h, 0);
    }

    #[inline]
    fn flag_idx(&self, x: usize, y: usize) -> usize {
        (y + 1) * self.stride + x + 1
    }

    /// Spread a new significant sample (sign `s`) into the neighbourhood.
    fn update_flags(&mut self, fi: usize, s: u32) {
        const MOD: [u16; 8] = [
            SIG_S,
            SIG_S | SGN_S,
            SIG_E,
            SIG_E | SGN_E,
            SIG_W,
            SIG_W | SGN_W,
            SIG_N,
            SIG_N | SGN_N,
        ];
        let stride = self.stride;
        let s = s as usize;
        let np = fi - stride;
        let sp = fi + stride;
        self.flags[np - 1] |= SIG_SE;
        self.flags[np] |= MOD[s];
        self.flags[np + 1] |= SIG_SW;
        self.flags[fi - 1] |= MOD[s + 2];
        self.flags[fi] |= SIG;
        self.flags[fi + 1] |= MOD[s + 4];
        self.flags[sp - 1] |= SIG_NE;
        self.flags[sp] |= MOD[s + 6];
        self.flags[sp + 1] |= SIG_NW;
    }

    #[inline]
    fn masked(&self, fi: usize, vsc: bool) -> u16 {
        let f = self.flags[fi];
        if vsc {
            f & VSC_MASK
        } else {
            f
        }
    }

    // ----- compress side ---------------------------------------------------

    /// Load and condition the block samples: quantize (irreversible),
    /// add the fractional bits, apply the region-of-interest up-shift.
    /// Returns the magnitude maximum.
    fn pre_encode(
        &mut self,
        src: &SampleSource<'_>,
        src_stride: usize,
        offset: (usize, usize),
        stepsize: f32,
        roi_shift: u32,
    ) -> u32 {
        let mut max = 0u32;
        for y in 0..self.h {
            for x in 0..self.w {
                let raw = match src {
                    SampleSource::Int(data) => {
                        let v = data[(offset.1 + y) * src_stride + offset.0 + x];
                        (v.unsigned_abs() << NMSEDEC_FRACBITS, v < 0)
                    }
                    SampleSource::Float(data) => {
                        let v = data[(offset.1 + y) * src_stride + offset.0 + x];
                        let q = (v.abs() / stepsize * f32::from(1u16 << NMSEDEC_FRACBITS)) as u32;
                        (q, v < 0.0)
                    }
                };
                let mag = raw.0 << roi_shift;
                max = max.max(mag);
                self.enc_data[y * self.w + x] = mag | ((raw.1 as u32) << SIGN_BIT);
            }
        }
        max
    }

    #[allow(clippy::too_many_arguments)]
    fn sig_pass_enc(
        &mut self,
        mq: &mut MqEncoder,
        bpno: i32,
        orient: u32,
        raw: bool,
        vsc_mode: bool,
        nmsedec: &mut i32,
        track: bool,
    ) {
        let one = bpno as u32 + NMSEDEC_FRACBITS;
        for k in (0..self.h).step_by(4) {
            for i in 0..self.w {
                for j in k..(k + 4).min(self.h) {
                    let vsc = vsc_mode && (j == k + 3 || j == self.h - 1);
                    let fi = self.flag_idx(i, j);
                    let flag = self.masked(fi, vsc);
                    if flag & SIG_OTH != 0 && flag & (SIG | VISIT) == 0 {
                        let data = self.enc_data[j * self.w + i];
                        let v = ((data >> one) & 1) as u8;
                        if raw {
                            mq.bypass_encode(v);
                        } else {
                            mq.set_context(zc_context(flag, orient));
                            mq.encode(v);
                        }
                        if v != 0 {
                            let sign = (data >> SIGN_BIT) as u8;
                            if track {
                                *nmsedec += nmsedec_sig(data & !(1 << SIGN_BIT), bpno as u32);
                            }
                            if raw {
                                mq.bypass_encode(sign);
                            } else {
                                let (ctx, spb) = sc_context(flag);
                                mq.set_context(ctx);
                                mq.encode(sign ^ spb);
                            }
                            self.update_flags(fi, sign as u32);
                        }
                        self.flags[fi] |= VISIT;
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn ref_pass_enc(
        &mut self,
        mq: &mut MqEncoder,
        bpno: i32,
        raw: bool,
        vsc_mode: bool,
        nmsedec: &mut i32,
        track: bool,
    ) {
        let one = bpno as u32 + NMSEDEC_FRACBITS;
        for k in (0..self.h).step_by(4) {
            for i in 0..self.w {
                for j in k..(k + 4).min(self.h) {
                    let vsc = vsc_mode && (j == k + 3 || j == self.h - 1);
                    let fi = self.flag_idx(i, j);
                    let flag = self.masked(fi, vsc);
                    if flag & (SIG | VISIT) == SIG {
                        let data = self.enc_data[j * self.w + i];
                        if track {
                            *nmsedec += nmsedec_ref(data & !(1 << SIGN_BIT), bpno as u32);
                        }
                        let v = ((data >> one) & 1) as u8;
                        if raw {
                            mq.bypass_encode(v);
                        } else {
                            mq.set_context(mag_context(flag));
                            mq.encode(v);
                        }
                        self.flags[fi] |= REFINE;
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn cln_pass_enc(
        &mut self,
        mq: &mut MqEncoder,
        bpno: i32,
        orient: u32,
        vsc_mode: bool,
        nmsedec: &mut i32,
        track: bool,
    ) {
        let one = bpno as u32 + NMSEDEC_FRACBITS;
        for k in (0..self.h).step_by(4) {
            for i in 0..self.w {
                // Aggregation applies to complete, untouched stripes whose
                // neighbourhood is quiet.
                let full = k + 3 < self.h;
                let agg = if full {
                    let quiet = |j: usize, mask: bool| {
                        let f = self.masked(self.flag_idx(i, j), mask);
                        f & (SIG | VISIT | SIG_OTH) == 0
                    };
                    if vsc_mode {
                        quiet(k, false)
                            && quiet(k + 1, false)
                            && quiet(k + 2, false)
                            && quiet(k + 3, true)
                    } else {
                        quiet(k, false) && quiet(k + 1, false) && quiet(k + 2, false) && quiet(k + 3, false)
                    }
                } else {
                    false
                };

                let mut runlen = 0usize;
                if agg {
                    while runlen < 4 {
                        let data = self.enc_data[(k + runlen) * self.w + i];
                        if (data >> one) & 1 == 1 {
                            break;
                        }
                        runlen += 1;
                    }
                    mq.set_context(CTX_AGG);
                    mq.encode(u8::from(runlen != 4));
                    if runlen == 4 {
                        continue;
                    }
                    mq.set_context(CTX_UNI);
                    mq.encode((runlen >> 1) as u8);
                    mq.encode((runlen & 1) as u8);
                }

                for j in (k + runlen)..(k + 4).min(self.h) {
                    let vsc = vsc_mode && (j == k + 3 || j == self.h - 1);
                    let fi = self.flag_idx(i, j);
                    let flag = self.masked(fi, vsc);
                    let partial = agg && j == k + runlen;
                    if partial {
                        // Significance implied by the run length.
                        let data = self.enc_data[j * self.w + i];
                        if track {
                            *nmsedec += nmsedec_sig(data & !(1 << SIGN_BIT), bpno as u32);
                        }
                        let sign = (data >> SIGN_BIT) as u8;
                        let (ctx, spb) = sc_context(flag);
                        mq.set_context(ctx);
                        mq.encode(sign ^ spb);
                        self.update_flags(fi, sign as u32);
                    } else if flag & (SIG | VISIT) == 0 {
                        mq.set_context(zc_context(flag, orient));
                        let data = self.enc_data[j * self.w + i];
                        let v = ((data >> one) & 1) as u8;
                        mq.encode(v);
                        if v != 0 {
                            if track {
                                *nmsedec += nmsedec_sig(data & !(1 << SIGN_BIT), bpno as u32);
                            }
                            let sign = (data >> SIGN_BIT) as u8;
                            let (ctx, spb) = sc_context(flag);
                            mq.set_context(ctx);
                            mq.encode(sign ^ spb);
                            self.update_flags(fi, sign as u32);
                        }
                    }
                    self.flags[fi] &= !VISIT;
                }
            }
        }
    }

    /// Encode one code block; returns its total weighted distortion.
    ///
    /// Pass rates are recorded with the correction terms that make
    /// truncation at untruncated passes safe; trailing 0xFF bytes are
    /// never left as the last byte of a pass.
    #[allow(clippy::too_many_arguments)]
    pub fn encode_block(
        &mut self,
        cblk: &mut CodeBlock,
        orient: u32,
        level: u32,
        qmfbid: u32,
        stepsize: f32,
        cblksty: u8,
        mct_norm: f64,
        roi_shift: u32,
        src: SampleSource<'_>,
        src_stride: usize,
        offset: (usize, usize),
        track_distortion: bool,
    ) -> f64 {
        let w = cblk.width() as usize;
        let h = cblk.height() as usize;
        self.init_buffers(w, h);
        let max = self.pre_encode(&src, src_stride, offset, stepsize, roi_shift);

        let log_max = if max > 0 {
            crate::math::floor_log2(max) + 1
        } else {
            0
        };
        cblk.numbps = if max > 0 && log_max > NMSEDEC_FRACBITS {
            log_max - NMSEDEC_FRACBITS
        } else {
            0
        };
        cblk.num_passes_encoded = 0;
        cblk.passes.clear();
        if cblk.numbps == 0 {
            cblk.data.clear();
            return 0.0;
        }

        let termall = cblksty & CBLK_STY_TERMALL != 0;
        let lazy = cblksty & CBLK_STY_LAZY != 0;
        let vsc_mode = cblksty & CBLK_STY_VSC != 0;
        let numbps = cblk.numbps as i32;

        let mut mq = MqEncoder::new();
        mq.init();

        let mut bpno = numbps - 1;
        let mut passtype = 2u32;
        let mut cum = 0f64;

        let mut passno = 0usize;
        while bpno >= 0 && passno < MAX_PASSES {
            let mut nmsedec = 0i32;
            let raw = lazy && bpno < numbps - 4 && passtype < 2;
            match passtype {
                0 => self.sig_pass_enc(
                    &mut mq,
                    bpno,
                    orient,
                    raw,
                    vsc_mode,
                    &mut nmsedec,
                    track_distortion,
                ),
                1 => self.ref_pass_enc(&mut mq, bpno, raw, vsc_mode, &mut nmsedec, track_distortion),
                _ => {
                    self.cln_pass_enc(&mut mq, bpno, orient, vsc_mode, &mut nmsedec, track_distortion);
                    if cblksty & CBLK_STY_SEGSYM != 0 {
                        mq.segmark();
                    }
                }
            }

            if track_distortion {
                cum += wmsedec(nmsedec, level, orient, bpno, qmfbid, stepsize, mct_norm);
            }

            // Correction for truncating at a pass whose segment keeps
            // running; terminated passes need none.
            let mut correction = 4 + 1;
            let terminate = termall
                || (lazy
                    && ((bpno < numbps - 4 && passtype > 0)
                        || (bpno == numbps - 4 && passtype == 2)));
            let mut term = false;
            if terminate {
                correction = 0;
                let bypass_flush = if lazy {
                    if termall {
                        bpno < numbps - 4 && passtype < 2
                    } else {
                        passtype == 1
                    }
                } else {
                    false
                };
                if bypass_flush {
                    mq.bypass_flush();
                } else if cblksty & CBLK_STY_PTERM != 0 {
                    mq.flush_erterm();
                } else {
                    mq.flush();
                }
                term = true;
            } else if lazy && bpno < numbps - 4 {
                correction = u32::from(mq.pending_count() < 8) + 1;
            } else if mq.pending_count() < 5 {
                correction += 1;
            }

            passtype += 1;
            if passtype == 3 {
                passtype = 0;
                bpno -= 1;
            }

            let rate = (mq.num_bytes() + correction as i32).max(0) as u32;
            cblk.passes.push(EncPass {
                rate,
                distortiondec: cum,
                len: 0,
                term,
                slope: 0,
            });

            if bpno >= 0 {
                if term {
                    let next_raw = lazy && bpno < numbps - 4 && passtype < 2;
                    if next_raw {
                        mq.bypass_init();
                    } else {
                        mq.restart_init();
                    }
                }
                if cblksty & CBLK_STY_RESET != 0 {
                    mq.reset_states();
                }
            }
            passno += 1;
        }

        if let Some(last) = cblk.passes.last() {
            if !last.term {
                if cblksty & CBLK_STY_PTERM != 0 {
                    mq.flush_erterm();
                } else {
                    mq.flush();
                }
            }
        }

        cblk.num_passes_encoded = cblk.passes.len() as u32;
        cblk.data = mq.data().to_vec();

        // Clamp rates to what the stream really holds and keep passes from
        // ending on a stuffed byte.
        let total = cblk.data.len() as u32;
        let num_passes = cblk.passes.len();
        for passno in 0..num_passes {
            if !cblk.passes[passno].term {
                let mut max_bytes = total;
                if lazy {
                    for later in cblk.passes[passno + 1..].iter() {
                        if later.term {
                            let mut next_rate = later.rate;
                            if next_rate > 0
                                && cblk.data.get(next_rate as usize - 1) == Some(&0xFF)
                            {
                                next_rate -= 1;
                            }
                            max_bytes = max_bytes.min(next_rate);
                            break;
                        }
                    }
                }
                if cblk.passes[passno].rate > max_bytes {
                    cblk.passes[passno].rate = max_bytes;
                }
                if cblk.passes[passno].rate > 0
                    && cblk.data.get(cblk.passes[passno].rate as usize - 1) == Some(&0xFF)
                {
                    cblk.passes[passno].rate -= 1;
                }
            }
            let prev = if passno == 0 {
                0
            } else {
                cblk.passes[passno - 1].rate
            };
            // Monotone by construction; the clamp can only level them.
            let rate = cblk.passes[passno].rate.max(prev);
            cblk.passes[passno].rate = rate;
            cblk.passes[passno].len = rate - prev;
        }

        cum
    }

    // ----- decompress side -------------------------------------------------

    fn sig_pass_dec(
        &mut self,
        mq: &mut MqDecoder<'_>,
        bpno: i32,
        orient: u32,
        vsc_mode: bool,
    ) {
        let one = 1i32 << bpno;
        let oneplushalf = one | (one >> 1);
        for k in (0..self.h).step_by(4) {
            for i in 0..self.w {
                for j in k..(k + 4).min(self.h) {
                    let vsc = vsc_mode && (j == k + 3 || j == self.h - 1);
                    let fi = self.flag_idx(i, j);
                    let flag = self.masked(fi, vsc);
                    if flag & SIG_OTH != 0 && flag & SIG == 0 {
                        mq.set_context(zc_context(flag, orient));
                        if mq.decode() != 0 {
                            let (ctx, spb) = sc_context(flag);
                            mq.set_context(ctx);
                            let v = mq.decode() ^ spb;
                            self.dec_data[j * self.w + i] =
                                if v != 0 { -oneplushalf } else { oneplushalf };
                            self.update_flags(fi, v as u32);
                        }
                        self.flags[fi] |= VISIT;
                    }
                }
            }
        }
    }

    fn sig_pass_raw_dec(&mut self, raw: &mut RawDecoder<'_>, bpno: i32, vsc_mode: bool) {
        let one = 1i32 << bpno;
        let oneplushalf = one | (one >> 1);
        for k in (0..self.h).step_by(4) {
            for i in 0..self.w {
                for j in k..(k + 4).min(self.h) {
                    let vsc = vsc_mode && (j == k + 3 || j == self.h - 1);
                    let fi = self.flag_idx(i, j);
                    let flag = self.masked(fi, vsc);
                    if flag & SIG_OTH != 0 && flag & SIG == 0 {
                        if raw.decode() != 0 {
                            let v = raw.decode();
                            self.dec_data[j * self.w + i] =
                                if v != 0 { -oneplushalf } else { oneplushalf };
                            self.update_flags(fi, v as u32);
                        }
                        self.flags[fi] |= VISIT;
                    }
                }
            }
        }
    }

    fn ref_pass_dec(&mut self, mq: &mut MqDecoder<'_>, bpno: i32, vsc_mode: bool) {
        let one = 1i32 << bpno;
        let poshalf = one >> 1;
        for k in (0..self.h).step_by(4) {
            for i in 0..self.w {
                for j in k..(k + 4).min(self.h) {
                    let vsc = vsc_mode && (j == k + 3 || j == self.h - 1);
                    let fi = self.flag_idx(i, j);
                    let flag = self.masked(fi, vsc);
                    if flag & (SIG | VISIT) == SIG {
                        mq.set_context(mag_context(flag));
                        let v = mq.decode();
                        let di = j * self.w + i;
                        let neg = self.dec_data[di] < 0;
                        self.dec_data[di] += if (v != 0) ^ neg { poshalf } else { -poshalf };
                        self.flags[fi] |= REFINE;
                    }
                }
            }
        }
    }

    fn ref_pass_raw_dec(&mut self, raw: &mut RawDecoder<'_>, bpno: i32, vsc_mode: bool) {
        let one = 1i32 << bpno;
        let poshalf = one >> 1;
        for k in (0..self.h).step_by(4) {
            for i in 0..self.w {
                for j in k..(k + 4).min(self.h) {
                    let vsc = vsc_mode && (j == k + 3 || j == self.h - 1);
                    let fi = self.flag_idx(i, j);
                    let flag = self.masked(fi, vsc);
                    if flag & (SIG | VISIT) == SIG {
                        let v = raw.decode();
                        let di = j * self.w + i;
                        let neg = self.dec_data[di] < 0;
                        self.dec_data[di] += if (v != 0) ^ neg { poshalf } else { -poshalf };
                        self.flags[fi] |= REFINE;
                    }
                }
            }
        }
    }

    fn cln_pass_dec(
        &mut self,
        mq: &mut MqDecoder<'_>,
        bpno: i32,
        orient: u32,
        cblksty: u8,
    ) {
        let vsc_mode = cblksty & CBLK_STY_VSC != 0;
        let one = 1i32 << bpno;
        let oneplushalf = one | (one >> 1);
        for k in (0..self.h).step_by(4) {
            for i in 0..self.w {
                let full = k + 3 < self.h;
                let agg = if full {
                    let quiet = |j: usize, mask: bool| {
                        let f = self.masked(self.flag_idx(i, j), mask);
                        f & (SIG | VISIT | SIG_OTH) == 0
                    };
                    if vsc_mode {
                        quiet(k, false)
                            && quiet(k + 1, false)
                            && quiet(k + 2, false)
                            && quiet(k + 3, true)
                    } else {
                        quiet(k, false) && quiet(k + 1, false) && quiet(k + 2, false) && quiet(k + 3, false)
                    }
                } else {
                    false
                };

                let mut runlen = 0usize;
                if agg {
                    mq.set_context(CTX_AGG);
                    if mq.decode() == 0 {
                        continue;
                    }
                    mq.set_context(CTX_UNI);
                    runlen = (mq.decode() as usize) << 1;
                    runlen |= mq.decode() as usize;
                }

                for j in (k + runlen)..(k + 4).min(self.h) {
                    let vsc = vsc_mode && (j == k + 3 || j == self.h - 1);
                    let fi = self.flag_idx(i, j);
                    let flag = self.masked(fi, vsc);
                    let partial = agg && j == k + runlen;
                    if partial {
                        let (ctx, spb) = sc_context(flag);
                        mq.set_context(ctx);
                        let v = mq.decode() ^ spb;
                        self.dec_data[j * self.w + i] =
                            if v != 0 { -oneplushalf } else { oneplushalf };
                        self.update_flags(fi, v as u32);
                    } else if flag & (SIG | VISIT) == 0 {
                        mq.set_context(zc_context(flag, orient));
                        if mq.decode() != 0 {
                            let (ctx, spb) = sc_context(flag);
                            mq.set_context(ctx);
                            let v = mq.decode() ^ spb;
                            self.dec_data[j * self.w + i] =
                                if v != 0 { -oneplushalf } else { oneplushalf };
                            self.update_flags(fi, v as u32);
                        }
                    }
                    self.flags[fi] &= !VISIT;
                }
            }
        }
        if cblksty & CBLK_STY_SEGSYM != 0 {
            mq.set_context(CTX_UNI);
            let mut v = mq.decode();
            v = (v << 1) | mq.decode();
            v = (v << 1) | mq.decode();
            v = (v << 1) | mq.decode();
            if v != 0xA {
                log::warn!("bad segmentation symbol {v:#x}");
            }
        }
    }

    /// Decode one code block into `dec_data`. Returns false when the block
    /// must be treated as failed (output zeroed by the caller).
    ///
    /// `cblk.numbps` is the plane count signalled by the packet headers,
    /// which already carries any region-of-interest up-shift; the matching
    /// down-shift happens in `post_decode`.
    pub fn decode_block(&mut self, cblk: &CodeBlock, orient: u32, cblksty: u8) -> bool {
        let w = cblk.width() as usize;
        let h = cblk.height() as usize;
        self.init_buffers(w, h);
        if cblk.num_segments == 0 || cblk.compressed.is_empty() {
            return true;
        }

        let numbps = cblk.numbps as i32;
        let mut bpno_plus_one = numbps;
        if bpno_plus_one > 31 {
            return false;
        }
        let mut passtype = 2u32;
        let lazy = cblksty & CBLK_STY_LAZY != 0;
        let vsc_mode = cblksty & CBLK_STY_VSC != 0;

        let mut mq = MqDecoder::new(&[]);
        for segno in 0..cblk.num_segments {
            let seg = &cblk.segments[segno];
            let start = seg.dataindex as usize;
            let end = (start + seg.len as usize).min(cblk.compressed.len());
            if start > end {
                return false;
            }
            let seg_data = &cblk.compressed[start..end];
            let raw_seg = lazy && (bpno_plus_one <= numbps - 4) && passtype < 2;
            let mut raw = RawDecoder::new(seg_data);
            if !raw_seg {
                mq.init(seg_data);
            }

            let mut passno = 0;
            while passno < seg.numpasses && bpno_plus_one >= 1 {
                match passtype {
                    0 => {
                        if raw_seg {
                            self.sig_pass_raw_dec(&mut raw, bpno_plus_one, vsc_mode);
                        } else {
                            self.sig_pass_dec(&mut mq, bpno_plus_one, orient, vsc_mode);
                        }
                    }
                    1 => {
                        if raw_seg {
                            self.ref_pass_raw_dec(&mut raw, bpno_plus_one, vsc_mode);
                        } else {
                            self.ref_pass_dec(&mut mq, bpno_plus_one, vsc_mode);
                        }
                    }
                    _ => self.cln_pass_dec(&mut mq, bpno_plus_one, orient, cblksty),
                }

                if cblksty & CBLK_STY_RESET != 0 && !raw_seg {
                    mq.reset_states();
                }
                passtype += 1;
                if passtype == 3 {
                    passtype = 0;
                    bpno_plus_one -= 1;
                }
                passno += 1;
            }
        }
        true
    }

    /// ROI down-shift, dequantization, and copy into the tile buffer at the
    /// block offset. The sink picks the reversible (`>> 1`) or irreversible
    /// (`* stepsize`) reconstruction; `dst_stride` is the tile-component
    /// row pitch.
    #[allow(clippy::too_many_arguments)]
    pub fn post_decode(
        block_data: &[i32],
        w: usize,
        h: usize,
        roi_shift: u32,
        stepsize: f32,
        dst: SampleSink<'_>,
        dst_stride: usize,
        offset: (usize, usize),
    ) {
        let mut shifted;
        let data = if roi_shift > 0 {
            let threshold = 1i32 << roi_shift;
            shifted = block_data.to_vec();
            for v in &mut shifted {
                let mag = v.abs();
                if mag >= threshold {
                    *v = v.signum() * (mag >> roi_shift);
                }
            }
            &shifted[..]
        } else {
            block_data
        };

        match dst {
            SampleSink::Int(dst) => {
                for y in 0..h {
                    for x in 0..w {
                        dst[(offset.1 + y) * dst_stride + offset.0 + x] = data[y * w + x] / 2;
                    }
                }
            }
            SampleSink::Float(dst) => {
                for y in 0..h {
                    for x in 0..w {
                        dst[(offset.1 + y) * dst_stride + offset.0 + x] =
                            data[y * w + x] as f32 * stepsize;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Rect;
    use crate::tile::Segment;

    fn xorshift(state: &mut u32) -> u32 {
        *state ^= *state << 13;
        *state ^= *state >> 17;
        *state ^= *state << 5;
        *state
    }

    /// Encode a block of raw samples, feed all passes into one layer, and
    /// decode it back.
    fn roundtrip(samples: &[i32], w: u32, h: u32, orient: u32, cblksty: u8) -> Vec<i32> {
        let mut cblk = CodeBlock {
            rect: Rect::new(0, 0, w, h),
            ..Default::default()
        };
        cblk.reset_encode(1);
        let mut t1 = T1Coder::new();
        t1.encode_block(
            &mut cblk,
            orient,
            0,
            1,
            1.0,
            cblksty,
            1.0,
            0,
            SampleSource::Int(samples),
            w as usize,
            (0, 0),
            false,
        );

        // Hand every encoded pass to the decoder the way Tier-2 would:
        // split at terminated passes.
        let mut dec = CodeBlock {
            rect: Rect::new(0, 0, w, h),
            numbps: cblk.numbps,
            compressed: cblk.data.clone(),
            ..Default::default()
        };
        let mut start = 0u32;
        let mut passes_in_seg = 0u32;
        for (i, pass) in cblk.passes.iter().enumerate() {
            passes_in_seg += 1;
            let last = i + 1 == cblk.passes.len();
            if pass.term || last {
                let end = pass.rate;
                dec.segments.push(Segment {
                    numpasses: passes_in_seg,
                    maxpasses: passes_in_seg,
                    numpasses_in_packet: passes_in_seg,
                    newlen: end - start,
                    len: end - start,
                    dataindex: start,
                });
                dec.num_segments += 1;
                start = end;
                passes_in_seg = 0;
            }
        }
        let mut t1d = T1Coder::new();
        assert!(t1d.decode_block(&dec, orient, cblksty));
        t1d.dec_data.iter().map(|&v| v / 2).collect()
    }

    #[test]
    fn test_lossless_block_roundtrip_plain() {
        let mut state = 123u32;
        for &(w, h) in &[(4u32, 4u32), (8, 8), (16, 13), (32, 32), (5, 9)] {
            let samples: Vec<i32> = (0..w * h)
                .map(|_| (xorshift(&mut state) % 511) as i32 - 255)
                .collect();
            let out = roundtrip(&samples, w, h, 0, 0);
            assert_eq!(samples, out, "block {w}x{h}");
        }
    }

    #[test]
    fn test_lossless_block_roundtrip_all_orients() {
        let mut state = 55u32;
        for orient in 0..4u32 {
            let samples: Vec<i32> = (0..16 * 16)
                .map(|_| (xorshift(&mut state) % 1023) as i32 - 511)
                .collect();
            let out = roundtrip(&samples, 16, 16, orient, 0);
            assert_eq!(samples, out, "orient {orient}");
        }
    }

    #[test]
    fn test_block_roundtrip_mode_switches() {
        let mut state = 777u32;
        let styles = [
            CBLK_STY_VSC,
            CBLK_STY_TERMALL,
            CBLK_STY_SEGSYM,
            CBLK_STY_LAZY,
            CBLK_STY_LAZY | CBLK_STY_TERMALL,
            CBLK_STY_VSC | CBLK_STY_TERMALL,
            CBLK_STY_RESET,
            CBLK_STY_PTERM,
            CBLK_STY_LAZY | CBLK_STY_VSC | CBLK_STY_SEGSYM,
        ];
        for &sty in &styles {
            let samples: Vec<i32> = (0..32 * 32)
                .map(|_| (xorshift(&mut state) % 2047) as i32 - 1023)
                .collect();
            let out = roundtrip(&samples, 32, 32, 1, sty);
            assert_eq!(samples, out, "style {sty:#04x}");
        }
    }

    #[test]
    fn test_sparse_and_constant_blocks() {
        let mut samples = vec![0i32; 32 * 32];
        assert_eq!(roundtrip(&samples, 32, 32, 0, 0), samples);
        samples[5 * 32 + 7] = 100;
        samples[20 * 32 + 30] = -3;
        assert_eq!(roundtrip(&samples, 32, 32, 0, 0), samples);
        let flat = vec![-42i32; 16 * 16];
        assert_eq!(roundtrip(&flat, 16, 16, 0, 0), flat);
    }

    #[test]
    fn test_pass_rates_monotone() {
        let mut state = 31u32;
        let samples: Vec<i32> = (0..32 * 32)
            .map(|_| (xorshift(&mut state) % 4095) as i32 - 2047)
            .collect();
        let mut cblk = CodeBlock {
            rect: Rect::new(0, 0, 32, 32),
            ..Default::default()
        };
        cblk.reset_encode(1);
        let mut t1 = T1Coder::new();
        let disto = t1.encode_block(
            &mut cblk,
            0,
            0,
            1,
            1.0,
            0,
            1.0,
            0,
            SampleSource::Int(&samples),
            32,
            (0, 0),
            true,
        );
        assert!(disto > 0.0);
        let mut prev_rate = 0;
        let mut prev_disto = 0.0;
        for pass in &cblk.passes {
            assert!(pass.rate >= prev_rate);
            assert!(pass.distortiondec >= prev_disto);
            prev_rate = pass.rate;
            prev_disto = pass.distortiondec;
        }
        assert!(prev_rate as usize <= cblk.data.len());
        // Distortion estimates are finite and positive for a noisy block.
        assert!(cblk.passes.last().unwrap().distortiondec.is_finite());
    }

    #[test]
    fn test_roi_shift_roundtrip() {
        let mut state = 9u32;
        let samples: Vec<i32> = (0..16 * 16)
            .map(|_| (xorshift(&mut state) % 255) as i32 - 127)
            .collect();
        let shift = 4u32;
        let mut cblk = CodeBlock {
            rect: Rect::new(0, 0, 16, 16),
            ..Default::default()
        };
        cblk.reset_encode(1);
        let mut t1 = T1Coder::new();
        t1.encode_block(
            &mut cblk,
            0,
            0,
            1,
            1.0,
            0,
            1.0,
            shift,
            SampleSource::Int(&samples),
            16,
            (0, 0),
            false,
        );
        let mut dec = CodeBlock {
            rect: Rect::new(0, 0, 16, 16),
            numbps: cblk.numbps,
            compressed: cblk.data.clone(),
            ..Default::default()
        };
        dec.segments.push(Segment {
            numpasses: cblk.num_passes_encoded,
            maxpasses: cblk.num_passes_encoded,
            numpasses_in_packet: cblk.num_passes_encoded,
            newlen: cblk.data.len() as u32,
            len: cblk.data.len() as u32,
            dataindex: 0,
        });
        dec.num_segments = 1;
        let mut t1d = T1Coder::new();
        assert!(t1d.decode_block(&dec, 0, 0));
        let mut out = vec![0i32; 16 * 16];
        T1Coder::post_decode(
            &t1d.dec_data,
            16,
            16,
            shift,
            1.0,
            SampleSink::Int(&mut out),
            16,
            (0, 0),
        );
        assert_eq!(samples, out);
    }
}
