// ============================================================================
// GPU SHADERS — all WGSL code kept inline for containment
// ============================================================================
//
// Templates use `{{NAME}}` placeholders filled by the helpers at the bottom.
// The coordinate kernel mirrors ops/pipeline.rs and ops/distortion.rs; a
// change to the math on one side must be made on the other.

use super::caps::Workgroup;
use crate::ops::expr::{NoiseFn, WGSL_PRELUDE};

// ============================================================================
// COORDINATE KERNEL — noise, warp, distortions, metric, curve lookup
// ============================================================================
//
// One invocation per pixel of the current tile.  The metric is a uniform, so
// every metric shares this one kernel; only the noise function differs per job.
//
// Workgroup (x, y, z): x walks columns, y and z both walk rows
// (row = gid.y * WG_Z + gid.z), so 3-D shapes still cover a flat tile.
//
// Output:  values[i]  = curve value | (1 << 8) when the noise was non-finite
//          indices[i] = curve index
pub const COORDINATE_SHADER: &str = r#"
struct CoordinateParams {
    width: u32,
    height: u32,
    tile_x: u32,
    tile_y: u32,
    tile_w: u32,
    tile_h: u32,
    curve_width: u32,
    metric: u32,
    flags: u32,
    center_x: f32,
    center_y: f32,
    scale: f32,
    curve_scaling: f32,
    ang_frequency: f32,
    ang_amplitude: f32,
    ang_offset: f32,
    frac_scale1: f32,
    frac_scale2: f32,
    frac_scale3: f32,
    frac_strength: f32,
    modulus: f32,
    checker_step: f32,
    _pad0: u32,
    _pad1: u32,
};

const FLAG_ANGULAR: u32 = 1u;
const FLAG_FRACTAL: u32 = 2u;
const FLAG_MODULUS: u32 = 4u;
const FLAG_CHECKER: u32 = 8u;
const DEGENERATE_BIT: u32 = 256u;

@group(0) @binding(0) var<uniform> params: CoordinateParams;
@group(0) @binding(1) var<storage, read> curve: array<u32>;
@group(0) @binding(2) var<storage, read_write> values: array<u32>;
@group(0) @binding(3) var<storage, read_write> indices: array<u32>;

{{PRELUDE}}

{{NOISE_FN}}

fn fold(v: f32, m: f32) -> f32 {
    let h = m * 0.5;
    return nf_mod(v + h, m) - h;
}

fn metric_distance(metric: u32, x: f32, y: f32) -> f32 {
    let a = abs(x);
    let b = abs(y);
    switch metric {
        case 1u: { return a; }
        case 2u: { return b; }
        case 3u: { return a + b; }
        case 4u: { return max(a, b); }
        case 5u: { return nf_cbrt(a * a * a + b * b * b); }
        case 6u: { return (a + b + abs(x + y)) * 0.5; }
        case 7u: { return max(b, a * 0.8660254 + b * 0.5); }
        case 8u: { return max(a, b) + 0.41421356 * min(a, b); }
        case 9u: { return sqrt(sqrt(a * a * a * a + b * b * b * b)); }
        default: { return sqrt(x * x + y * y); }
    }
}

fn degenerate(i: u32) {
    values[i] = (curve[0] & 0xFFu) | DEGENERATE_BIT;
    indices[i] = 0u;
}

@compute @workgroup_size({{WG_X}}, {{WG_Y}}, {{WG_Z}})
fn cs_coordinate(@builtin(global_invocation_id) gid: vec3<u32>) {
    let lx = gid.x;
    let ly = gid.y * {{WG_Z}}u + gid.z;
    if (lx >= params.tile_w || ly >= params.tile_h) {
        return;
    }
    let px = params.tile_x + lx;
    let py = params.tile_y + ly;
    if (px >= params.width || py >= params.height) {
        return;
    }
    let i = py * params.width + px;

    let x = (f32(px) - params.center_x) * params.scale;
    let y = (f32(py) - params.center_y) * params.scale;

    let n = noise_fn(x, y);
    if (!nf_is_finite(n)) {
        degenerate(i);
        return;
    }

    // Scalar-radius warp.
    var wx = 0.0;
    var wy = 0.0;
    let r = sqrt(x * x + y * y);
    if (r > 0.0) {
        let k = n / r;
        wx = x * k;
        wy = y * k;
    }

    if ((params.flags & FLAG_MODULUS) != 0u) {
        wx = fold(wx, params.modulus);
        wy = fold(wy, params.modulus);
    }

    if ((params.flags & FLAG_FRACTAL) != 0u) {
        let dx = sin(wy * params.frac_scale1) * 0.3
               + sin(wy * params.frac_scale2) * 0.2
               + sin(wy * params.frac_scale3) * 0.1;
        let dy = sin(wx * params.frac_scale1) * 0.3
               + sin(wx * params.frac_scale2) * 0.2
               + sin(wx * params.frac_scale3) * 0.1;
        wx = wx + dx * params.frac_strength;
        wy = wy + dy * params.frac_strength;
    }

    if ((params.flags & FLAG_ANGULAR) != 0u) {
        let rr = sqrt(wx * wx + wy * wy);
        var angle = atan2(wy, wx) + params.ang_offset;
        angle = angle + sin(angle * params.ang_frequency) * params.ang_amplitude * 0.01;
        wx = rr * cos(angle);
        wy = rr * sin(angle);
    }

    let d = metric_distance(params.metric, wx, wy);
    let scaled = d * params.curve_scaling;
    if (!nf_is_finite(scaled)) {
        degenerate(i);
        return;
    }

    let w = f32(params.curve_width);
    var idx_f = floor(scaled % w);
    if (idx_f < 0.0) {
        idx_f = idx_f + w;
    }
    let idx = min(u32(max(idx_f, 0.0)), params.curve_width - 1u);
    var value = curve[idx] & 0xFFu;

    if ((params.flags & FLAG_CHECKER) != 0u) {
        let d0 = metric_distance(params.metric, x, y);
        let band = floor(d0 / params.checker_step);
        if (nf_is_finite(band) && nf_mod(band, 2.0) == 1.0) {
            value = 255u - value;
        }
    }

    values[i] = value;
    indices[i] = idx;
}
"#;

// ============================================================================
// COMPOSITE KERNEL — value plane → packed RGBA through a 256-entry palette
// ============================================================================
pub const COMPOSITE_SHADER: &str = r#"
struct CompositeParams {
    count: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
};

@group(0) @binding(0) var<uniform> params: CompositeParams;
@group(0) @binding(1) var<storage, read> palette: array<u32>;
@group(0) @binding(2) var<storage, read> values: array<u32>;
@group(0) @binding(3) var<storage, read_write> pixels: array<u32>;

@compute @workgroup_size({{WG}})
fn cs_composite(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    let i = gid.x + gid.y * groups.x * {{WG}}u;
    if (i >= params.count) {
        return;
    }
    pixels[i] = palette[values[i] & 0xFFu];
}
"#;

// ============================================================================
// BITONIC SORT — seed keys from points, then one compare-exchange step
// ============================================================================
//
// `cs_seed` writes distances (sentinel past `n`) and identity tags.
// `cs_bitonic_step` runs one (stage_size, step_size) step of the network;
// the host dispatches it once per step so each step sees the previous one.
pub const BITONIC_SHADER: &str = r#"
struct SortParams {
    padded: u32,
    n: u32,
    stage_size: u32,
    step_size: u32,
    descending: u32,
    center_x: f32,
    center_y: f32,
    _pad0: u32,
};

@group(0) @binding(0) var<uniform> params: SortParams;
@group(0) @binding(1) var<storage, read> points: array<vec2<f32>>;
@group(0) @binding(2) var<storage, read_write> keys: array<f32>;
@group(0) @binding(3) var<storage, read_write> tags: array<u32>;

fn flat_index(gid: vec3<u32>, groups: vec3<u32>) -> u32 {
    return gid.x + gid.y * groups.x * {{WG}}u;
}

fn sentinel() -> f32 {
    if (params.descending != 0u) {
        return bitcast<f32>(0xff800000u);
    }
    return bitcast<f32>(0x7f800000u);
}

fn precedes(da: f32, ia: u32, db: f32, ib: u32) -> bool {
    if (da != db) {
        if (params.descending != 0u) {
            return da > db;
        }
        return da < db;
    }
    return ia < ib;
}

@compute @workgroup_size({{WG}})
fn cs_seed(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    let i = flat_index(gid, groups);
    if (i >= params.padded) {
        return;
    }
    var d = sentinel();
    if (i < params.n) {
        let p = points[i] - vec2<f32>(params.center_x, params.center_y);
        d = sqrt(p.x * p.x + p.y * p.y);
        if (d != d) {
            d = sentinel();
        }
    }
    keys[i] = d;
    tags[i] = i;
}

@compute @workgroup_size({{WG}})
fn cs_bitonic_step(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    let i = flat_index(gid, groups);
    if (i >= params.padded) {
        return;
    }
    if ((i % (2u * params.step_size)) >= params.step_size) {
        return;
    }
    let partner = i + params.step_size;
    let forward = ((i / params.stage_size) % 2u) == 0u;

    let da = keys[i];
    let db = keys[partner];
    let ta = tags[i];
    let tb = tags[partner];
    if (precedes(da, ta, db, tb) != forward) {
        keys[i] = db;
        keys[partner] = da;
        tags[i] = tb;
        tags[partner] = ta;
    }
}
"#;

// ============================================================================
// SELF-TEST KERNEL — trivial write used to time the device
// ============================================================================
pub const SELF_TEST_SHADER: &str = r#"
@group(0) @binding(0) var<storage, read_write> probe: array<u32>;

@compute @workgroup_size({{WG}})
fn cs_self_test(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    let i = gid.x + gid.y * groups.x * {{WG}}u;
    if (i >= arrayLength(&probe)) {
        return;
    }
    probe[i] = i * 3u + 1u;
}
"#;

/// Fill the coordinate kernel for one expression and workgroup shape.
pub fn coordinate_kernel(noise: &NoiseFn, workgroup: Workgroup) -> String {
    COORDINATE_SHADER
        .replace("{{PRELUDE}}", WGSL_PRELUDE)
        .replace("{{NOISE_FN}}", &noise.to_wgsl())
        .replace("{{WG_X}}", &workgroup.x.to_string())
        .replace("{{WG_Y}}", &workgroup.y.to_string())
        .replace("{{WG_Z}}", &workgroup.z.to_string())
}

/// Fill a one-dimensional kernel template with its workgroup size.
pub fn linear_kernel(template: &str, size: u32) -> String {
    template.replace("{{WG}}", &size.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::expr::compile;

    #[test]
    fn coordinate_kernel_has_no_placeholders_left() {
        let noise = compile("sin(x) * 10 + mod(y, 3)").unwrap();
        let src = coordinate_kernel(&noise, Workgroup::new(8, 16, 2));
        assert!(!src.contains("{{"));
        assert!(src.contains("@workgroup_size(8, 16, 2)"));
        assert!(src.contains("gid.y * 2u + gid.z"));
        assert!(src.contains("fn noise_fn("));
        assert!(src.contains("fn nf_mod("));
    }

    #[test]
    fn every_metric_code_has_a_branch() {
        for metric in crate::model::DistanceMetric::ALL {
            let code = metric.gpu_code();
            if code != 0 {
                assert!(COORDINATE_SHADER.contains(&format!("case {}u:", code)), "{:?}", metric);
            }
        }
    }

    #[test]
    fn linear_kernels_fill_size() {
        for template in [COMPOSITE_SHADER, BITONIC_SHADER, SELF_TEST_SHADER] {
            let src = linear_kernel(template, 128);
            assert!(!src.contains("{{"));
            assert!(src.contains("@workgroup_size(128)"));
        }
    }
}
