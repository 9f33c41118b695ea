//! WGSL compute kernels
//!
//! Argument conventions mirror the host dispatch exactly (see `host.rs`);
//! every kernel takes a 32-byte uniform params block so one layout rule
//! covers all of them.

/// Fill a buffer range with a constant.
/// params: [offset, len, bitcast(value)]
pub const FILL_SRC: &str = r#"
struct Params {
    p0: u32,
    p1: u32,
    p2: u32,
    p3: u32,
    p4: u32,
    p5: u32,
    p6: u32,
    p7: u32,
}

@group(0) @binding(0) var<storage, read_write> dst: array<f32>;
@group(0) @binding(1) var<uniform> params: Params;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if (i < params.p1) {
        dst[params.p0 + i] = bitcast<f32>(params.p2);
    }
}
"#;

/// Interleaved complex multiply / multiply-accumulate, one thread per pair.
/// params: [pairs, accumulate]
pub const COMPLEX_SRC: &str = r#"
struct Params {
    p0: u32,
    p1: u32,
    p2: u32,
    p3: u32,
    p4: u32,
    p5: u32,
    p6: u32,
    p7: u32,
}

@group(0) @binding(0) var<storage, read_write> a: array<f32>;
@group(0) @binding(1) var<storage, read_write> b: array<f32>;
@group(0) @binding(2) var<storage, read_write> out: array<f32>;
@group(0) @binding(3) var<uniform> params: Params;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if (i >= params.p0) {
        return;
    }
    let ar = a[2u * i];
    let ai = a[2u * i + 1u];
    let br = b[2u * i];
    let bi = b[2u * i + 1u];
    let re = ar * br - ai * bi;
    let im = ar * bi + ai * br;
    if (params.p1 != 0u) {
        out[2u * i] = out[2u * i] + re;
        out[2u * i + 1u] = out[2u * i + 1u] + im;
    } else {
        out[2u * i] = re;
        out[2u * i + 1u] = im;
    }
}
"#;

/// Linear cross-fade: `out = w * new + (1 - w) * old`,
/// `w = (fade_offset + i + 1) / fade_len`.
/// params: [count, fade_len, fade_offset]
pub const CROSSFADE_SRC: &str = r#"
struct Params {
    p0: u32,
    p1: u32,
    p2: u32,
    p3: u32,
    p4: u32,
    p5: u32,
    p6: u32,
    p7: u32,
}

@group(0) @binding(0) var<storage, read_write> old_sig: array<f32>;
@group(0) @binding(1) var<storage, read_write> new_sig: array<f32>;
@group(0) @binding(2) var<storage, read_write> out: array<f32>;
@group(0) @binding(3) var<uniform> params: Params;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if (i >= params.p0) {
        return;
    }
    let w = min(f32(params.p2 + i + 1u) / f32(params.p1), 1.0);
    out[i] = w * new_sig[i] + (1.0 - w) * old_sig[i];
}
"#;

/// Time-domain FIR over a circular history, one thread per output sample:
/// `y[j] = sum(k in first_nz..last_nz) hist[(pos + j - k) mod N] * ir[k]`.
/// params: [first_nz, last_nz, hist_len, pos, n_out]
pub const TDCONV_SRC: &str = r#"
struct Params {
    p0: u32,
    p1: u32,
    p2: u32,
    p3: u32,
    p4: u32,
    p5: u32,
    p6: u32,
    p7: u32,
}

@group(0) @binding(0) var<storage, read_write> ir: array<f32>;
@group(0) @binding(1) var<storage, read_write> hist: array<f32>;
@group(0) @binding(2) var<storage, read_write> out: array<f32>;
@group(0) @binding(3) var<uniform> params: Params;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let j = gid.x;
    if (j >= params.p4) {
        return;
    }
    let mask = params.p2 - 1u;
    var sum = 0.0;
    for (var k = params.p0; k < params.p1; k = k + 1u) {
        let idx = (params.p3 + j - k) & mask;
        sum = sum + hist[idx] * ir[k];
    }
    out[j] = sum;
}
"#;
