//! CubeCL kernels for every per-pixel and per-voxel stage.
//!
//! Layouts match the host side: images are row-major, vectors are three
//! interleaved floats, matrices are 16 row-major floats, and the volume is
//! column-contiguous packed voxels (`(y * sx + x) * sz + z`).
//!
//! Loops never use `break` (CubeCL optimizer issue); early exits are done
//! with flags instead.

use cubecl::prelude::*;

/// Floats per tracking record: status, error, 6 Jacobian entries.
pub const RECORD_STRIDE: u32 = 8;
/// Floats per reduced system.
pub const SYSTEM_STRIDE: u32 = 32;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[cube]
fn mat_row<F: Float>(m: &Array<F>, row: u32, x: F, y: F, z: F, w: F) -> F {
    let b = row * 4;
    m[b] * x + m[b + 1] * y + m[b + 2] * z + m[b + 3] * w
}

#[cube]
fn voxel_distance<F: Float>(raw: u32) -> F {
    let bits = raw & 0xFFFFu32;
    let mut d = F::cast_from(bits);
    if bits >= 32768u32 {
        d = d - F::new(65536.0);
    }
    d / F::new(32766.0)
}

#[cube]
fn voxel_weight<F: Float>(raw: u32) -> F {
    F::cast_from(raw >> 16u32)
}

#[cube]
fn encode_voxel<F: Float>(distance: F, weight: F) -> u32 {
    let mut d = distance;
    if d > F::new(1.0) {
        d = F::new(1.0);
    }
    if d < F::new(-1.0) {
        d = F::new(-1.0);
    }
    let q = F::floor(d * F::new(32766.0) + F::new(0.5));
    let mut bits = 0u32;
    if q < F::new(0.0) {
        bits = u32::cast_from(q + F::new(65536.0));
    } else {
        bits = u32::cast_from(q);
    }
    let w = u32::cast_from(F::floor(weight + F::new(0.5)));
    bits | (w << 16u32)
}

#[cube]
fn clamp_index(v: i32, size: u32) -> u32 {
    let mut c = v;
    if c < 0i32 {
        c = 0i32;
    }
    let hi = i32::cast_from(size) - 1i32;
    if c > hi {
        c = hi;
    }
    u32::cast_from(c)
}

#[cube]
fn volume_value<F: Float>(volume: &Array<u32>, x: i32, y: i32, z: i32, sx: u32, sy: u32, sz: u32) -> F {
    let cx = clamp_index(x, sx);
    let cy = clamp_index(y, sy);
    let cz = clamp_index(z, sz);
    voxel_distance::<F>(volume[(cy * sx + cx) * sz + cz])
}

/// Trilinear blend of `value_at(corner + axis offset) - value_at(corner - axis offset)`
/// when `axis < 3`, or of the plain corner values when `axis == 3`.
#[cube]
fn trilinear_volume<F: Float>(
    volume: &Array<u32>,
    px: F,
    py: F,
    pz: F,
    sx: u32,
    sy: u32,
    sz: u32,
    dx: F,
    dy: F,
    dz: F,
    axis: u32,
) -> F {
    let gx = px * F::cast_from(sx) / dx - F::new(0.5);
    let gy = py * F::cast_from(sy) / dy - F::new(0.5);
    let gz = pz * F::cast_from(sz) / dz - F::new(0.5);
    let fx0 = F::floor(gx);
    let fy0 = F::floor(gy);
    let fz0 = F::floor(gz);
    let fx = gx - fx0;
    let fy = gy - fy0;
    let fz = gz - fz0;
    let bx = i32::cast_from(fx0);
    let by = i32::cast_from(fy0);
    let bz = i32::cast_from(fz0);

    let mut ox = 0i32;
    let mut oy = 0i32;
    let mut oz = 0i32;
    if axis == 0u32 {
        ox = 1i32;
    }
    if axis == 1u32 {
        oy = 1i32;
    }
    if axis == 2u32 {
        oz = 1i32;
    }

    let mut acc = F::new(0.0);
    for corner in 0..8u32 {
        let cx = bx + i32::cast_from(corner & 1u32);
        let cy = by + i32::cast_from((corner >> 1u32) & 1u32);
        let cz = bz + i32::cast_from((corner >> 2u32) & 1u32);

        let mut wx = F::new(1.0) - fx;
        if (corner & 1u32) == 1u32 {
            wx = fx;
        }
        let mut wy = F::new(1.0) - fy;
        if ((corner >> 1u32) & 1u32) == 1u32 {
            wy = fy;
        }
        let mut wz = F::new(1.0) - fz;
        if ((corner >> 2u32) & 1u32) == 1u32 {
            wz = fz;
        }

        let mut value = F::new(0.0);
        if axis == 3u32 {
            value = volume_value::<F>(volume, cx, cy, cz, sx, sy, sz);
        } else {
            value = volume_value::<F>(volume, cx + ox, cy + oy, cz + oz, sx, sy, sz)
                - volume_value::<F>(volume, cx - ox, cy - oy, cz - oz, sx, sy, sz);
        }
        acc += wx * wy * wz * value;
    }
    acc
}

// ---------------------------------------------------------------------------
// Volume
// ---------------------------------------------------------------------------

/// Set every voxel to the reset state. Launched over the volume grid, one
/// unit per voxel.
#[cube(launch_unchecked)]
pub fn init_volume_kernel(volume: &mut Array<u32>, sx: u32, sy: u32, sz: u32, empty: u32) {
    let x = ABSOLUTE_POS_X;
    let y = ABSOLUTE_POS_Y;
    let z = ABSOLUTE_POS_Z;
    if x < sx && y < sy && z < sz {
        volume[(y * sx + x) * sz + z] = empty;
    }
}

/// One unit per (x, y) column, marching z. Launched over the x-y plane of
/// the volume grid.
#[cube(launch_unchecked)]
pub fn integrate_kernel<F: Float>(
    volume: &mut Array<u32>,
    sx: u32,
    sy: u32,
    sz: u32,
    voxel_x: F,
    voxel_y: F,
    voxel_z: F,
    depth: &Array<F>,
    width: u32,
    height: u32,
    inv_pose: &Array<F>, // world -> camera, 16 floats
    k: &Array<F>,        // intrinsics, 16 floats
    mu: F,
    max_weight: F,
) {
    let x = ABSOLUTE_POS_X;
    let y = ABSOLUTE_POS_Y;
    if x < sx && y < sy {
        let one = F::new(1.0);
        let zero = F::new(0.0);

        let wx = (F::cast_from(x) + F::new(0.5)) * voxel_x;
        let wy = (F::cast_from(y) + F::new(0.5)) * voxel_y;
        let wz = F::new(0.5) * voxel_z;

        let mut pos_x = mat_row::<F>(inv_pose, 0, wx, wy, wz, one);
        let mut pos_y = mat_row::<F>(inv_pose, 1, wx, wy, wz, one);
        let mut pos_z = mat_row::<F>(inv_pose, 2, wx, wy, wz, one);
        let delta_x = inv_pose[2] * voxel_z;
        let delta_y = inv_pose[6] * voxel_z;
        let delta_z = inv_pose[10] * voxel_z;

        let mut cam_x = mat_row::<F>(k, 0, pos_x, pos_y, pos_z, zero);
        let mut cam_y = mat_row::<F>(k, 1, pos_x, pos_y, pos_z, zero);
        let mut cam_z = mat_row::<F>(k, 2, pos_x, pos_y, pos_z, zero);
        let cam_dx = mat_row::<F>(k, 0, delta_x, delta_y, delta_z, zero);
        let cam_dy = mat_row::<F>(k, 1, delta_x, delta_y, delta_z, zero);
        let cam_dz = mat_row::<F>(k, 2, delta_x, delta_y, delta_z, zero);

        let base = (y * sx + x) * sz;
        let max_x = F::cast_from(width) - one;
        let max_y = F::cast_from(height) - one;

        for z in 0..sz {
            if pos_z >= F::new(0.0001) {
                let px = cam_x / cam_z + F::new(0.5);
                let py = cam_y / cam_z + F::new(0.5);
                let inside = px >= zero && px <= max_x && py >= zero && py <= max_y;
                if inside {
                    let measured = depth[u32::cast_from(py) * width + u32::cast_from(px)];
                    if measured > zero {
                        let rx = pos_x / pos_z;
                        let ry = pos_y / pos_z;
                        let scale = F::sqrt(one + rx * rx + ry * ry);
                        let diff = (measured - cam_z) * scale;
                        if diff > zero - mu {
                            let mut sdf = diff / mu;
                            if sdf > one {
                                sdf = one;
                            }
                            let raw = volume[base + z];
                            let w = voxel_weight::<F>(raw);
                            let d = (voxel_distance::<F>(raw) * w + sdf) / (w + one);
                            let mut new_w = w + one;
                            if new_w > max_weight {
                                new_w = max_weight;
                            }
                            volume[base + z] = encode_voxel::<F>(d, new_w);
                        }
                    }
                }
            }
            pos_x += delta_x;
            pos_y += delta_y;
            pos_z += delta_z;
            cam_x += cam_dx;
            cam_y += cam_dy;
            cam_z += cam_dz;
        }
    }
}

/// Ray march one pixel per thread. `max_steps` bounds the march loop.
#[cube(launch_unchecked)]
pub fn raycast_kernel<F: Float>(
    volume: &Array<u32>,
    sx: u32,
    sy: u32,
    sz: u32,
    dim_x: F,
    dim_y: F,
    dim_z: F,
    view: &Array<F>, // pose * K^-1
    width: u32,
    height: u32,
    near_plane: F,
    far_plane: F,
    step: F,
    large_step: F,
    max_steps: u32,
    vertex: &mut Array<F>,
    normal: &mut Array<F>,
    depth: &mut Array<F>,
) {
    let px = ABSOLUTE_POS_X;
    let py = ABSOLUTE_POS_Y;
    if px < width && py < height {
        let idx = py * width + px;
        let x = F::cast_from(px);
        let y = F::cast_from(py);
        let zero = F::new(0.0);
        let one = F::new(1.0);

        let ox = view[3];
        let oy = view[7];
        let oz = view[11];
        let dx = mat_row::<F>(view, 0, x, y, one, zero);
        let dy = mat_row::<F>(view, 1, x, y, one, zero);
        let dz = mat_row::<F>(view, 2, x, y, one, zero);

        // Slab intersection with [0, dim]. Zero direction components keep
        // the slab open when the origin lies inside it.
        let mut t_enter = near_plane;
        let mut t_exit = far_plane;
        let mut valid = true;

        let eps = F::new(0.000000000001);
        if F::abs(dx) < eps {
            if ox < zero || ox > dim_x {
                valid = false;
            }
        } else {
            let a = (zero - ox) / dx;
            let b = (dim_x - ox) / dx;
            let mut lo = a;
            let mut hi = b;
            if a > b {
                lo = b;
                hi = a;
            }
            if lo > t_enter {
                t_enter = lo;
            }
            if hi < t_exit {
                t_exit = hi;
            }
        }
        if F::abs(dy) < eps {
            if oy < zero || oy > dim_y {
                valid = false;
            }
        } else {
            let a = (zero - oy) / dy;
            let b = (dim_y - oy) / dy;
            let mut lo = a;
            let mut hi = b;
            if a > b {
                lo = b;
                hi = a;
            }
            if lo > t_enter {
                t_enter = lo;
            }
            if hi < t_exit {
                t_exit = hi;
            }
        }
        if F::abs(dz) < eps {
            if oz < zero || oz > dim_z {
                valid = false;
            }
        } else {
            let a = (zero - oz) / dz;
            let b = (dim_z - oz) / dz;
            let mut lo = a;
            let mut hi = b;
            if a > b {
                lo = b;
                hi = a;
            }
            if lo > t_enter {
                t_enter = lo;
            }
            if hi < t_exit {
                t_exit = hi;
            }
        }
        if t_enter >= t_exit {
            valid = false;
        }

        let mut hit = false;
        let mut t_hit = zero;

        if valid {
            let mut t = t_enter;
            let mut stepsize = large_step;
            let mut f_t = trilinear_volume::<F>(
                volume, ox + dx * t, oy + dy * t, oz + dz * t, sx, sy, sz, dim_x, dim_y, dim_z, 3u32,
            );
            let mut done = f_t <= zero;
            let mut fine = false;

            for _ in 0..max_steps {
                if !done && t < t_exit {
                    let f_tt = trilinear_volume::<F>(
                        volume, ox + dx * t, oy + dy * t, oz + dz * t, sx, sy, sz, dim_x, dim_y, dim_z, 3u32,
                    );
                    if f_tt < zero {
                        t_hit = t + stepsize * f_tt / (f_t - f_tt);
                        hit = true;
                        done = true;
                    } else if fine && f_tt > f_t {
                        done = true;
                    } else {
                        if f_tt < F::new(0.8) {
                            stepsize = step;
                            fine = true;
                        }
                        f_t = f_tt;
                        t += stepsize;
                    }
                }
            }
        }

        let base = idx * 3;
        if hit {
            let hx = ox + dx * t_hit;
            let hy = oy + dy * t_hit;
            let hz = oz + dz * t_hit;
            let gx = trilinear_volume::<F>(volume, hx, hy, hz, sx, sy, sz, dim_x, dim_y, dim_z, 0u32)
                / (F::new(2.0) * dim_x / F::cast_from(sx));
            let gy = trilinear_volume::<F>(volume, hx, hy, hz, sx, sy, sz, dim_x, dim_y, dim_z, 1u32)
                / (F::new(2.0) * dim_y / F::cast_from(sy));
            let gz = trilinear_volume::<F>(volume, hx, hy, hz, sx, sy, sz, dim_x, dim_y, dim_z, 2u32)
                / (F::new(2.0) * dim_z / F::cast_from(sz));
            let len = F::sqrt(gx * gx + gy * gy + gz * gz);

            vertex[base] = hx;
            vertex[base + 1] = hy;
            vertex[base + 2] = hz;
            if len > zero {
                normal[base] = gx / len;
                normal[base + 1] = gy / len;
                normal[base + 2] = gz / len;
            } else {
                normal[base] = F::new(-2.0);
                normal[base + 1] = zero;
                normal[base + 2] = zero;
            }
            depth[idx] = t_hit;
        } else {
            vertex[base] = zero;
            vertex[base + 1] = zero;
            vertex[base + 2] = zero;
            normal[base] = F::new(-2.0);
            normal[base + 1] = zero;
            normal[base + 2] = zero;
            depth[idx] = zero;
        }
    }
}

// ---------------------------------------------------------------------------
// Preprocessing
// ---------------------------------------------------------------------------

/// Copy every `stride`-th sample of device-resident metric depth into the
/// render-size buffer. Non-positive and non-finite samples become 0.
#[cube(launch_unchecked)]
pub fn ingest_depth_kernel<F: Float>(
    input: &Array<F>,
    in_width: u32,
    stride: u32,
    width: u32,
    height: u32,
    output: &mut Array<F>,
) {
    let x = ABSOLUTE_POS_X;
    let y = ABSOLUTE_POS_Y;
    if x < width && y < height {
        let d = input[(y * stride) * in_width + x * stride];
        let mut value = F::new(0.0);
        // NaN fails both comparisons; infinity fails the upper bound.
        if d > F::new(0.0) && d < F::new(3.0e38) {
            value = d;
        }
        output[y * width + x] = value;
    }
}

#[cube(launch_unchecked)]
pub fn bilateral_kernel<F: Float>(
    input: &Array<F>,
    width: u32,
    height: u32,
    gaussian: &Array<F>,
    e_delta: F,
    radius: u32,
    output: &mut Array<F>,
) {
    let x = ABSOLUTE_POS_X;
    let y = ABSOLUTE_POS_Y;
    if x < width && y < height {
        let idx = y * width + x;
        let center = input[idx];
        let zero = F::new(0.0);

        if center == zero {
            output[idx] = zero;
        } else {
            let inv_range = F::new(1.0) / (F::new(2.0) * e_delta * e_delta);
            let diameter = 2u32 * radius + 1u32;
            let r = i32::cast_from(radius);
            let mut sum = zero;
            let mut total = zero;
            for j in 0..diameter {
                let yy = clamp_index(i32::cast_from(y) + i32::cast_from(j) - r, height);
                for i in 0..diameter {
                    let xx = clamp_index(i32::cast_from(x) + i32::cast_from(i) - r, width);
                    let cur = input[yy * width + xx];
                    if cur > zero {
                        let diff = cur - center;
                        let factor = gaussian[i] * gaussian[j] * F::exp(zero - diff * diff * inv_range);
                        total += factor;
                        sum += factor * cur;
                    }
                }
            }
            output[idx] = sum / total;
        }
    }
}

/// `out_width x out_height` output; input is twice as large.
#[cube(launch_unchecked)]
pub fn half_sample_kernel<F: Float>(
    input: &Array<F>,
    out_width: u32,
    out_height: u32,
    e_d: F,
    output: &mut Array<F>,
) {
    let ox = ABSOLUTE_POS_X;
    let oy = ABSOLUTE_POS_Y;
    if ox < out_width && oy < out_height {
        let idx = oy * out_width + ox;
        let in_width = out_width * 2u32;
        let sx = ox * 2u32;
        let sy = oy * 2u32;
        let center = input[sy * in_width + sx];
        let mut sum = F::new(0.0);
        let mut count = F::new(0.0);
        for j in 0..2u32 {
            for i in 0..2u32 {
                let cur = input[(sy + j) * in_width + sx + i];
                if F::abs(cur - center) < e_d {
                    sum += cur;
                    count += F::new(1.0);
                }
            }
        }
        output[idx] = sum / count;
    }
}

#[cube(launch_unchecked)]
pub fn depth_to_vertex_kernel<F: Float>(
    depth: &Array<F>,
    width: u32,
    height: u32,
    inv_k: &Array<F>,
    vertex: &mut Array<F>,
) {
    let px = ABSOLUTE_POS_X;
    let py = ABSOLUTE_POS_Y;
    if px < width && py < height {
        let idx = py * width + px;
        let x = F::cast_from(px);
        let y = F::cast_from(py);
        let d = depth[idx];
        let base = idx * 3;
        let zero = F::new(0.0);
        if d > zero {
            vertex[base] = d * mat_row::<F>(inv_k, 0, x, y, F::new(1.0), zero);
            vertex[base + 1] = d * mat_row::<F>(inv_k, 1, x, y, F::new(1.0), zero);
            vertex[base + 2] = d * mat_row::<F>(inv_k, 2, x, y, F::new(1.0), zero);
        } else {
            vertex[base] = zero;
            vertex[base + 1] = zero;
            vertex[base + 2] = zero;
        }
    }
}

#[cube(launch_unchecked)]
pub fn vertex_to_normal_kernel<F: Float>(vertex: &Array<F>, width: u32, height: u32, normal: &mut Array<F>) {
    let x = ABSOLUTE_POS_X;
    let y = ABSOLUTE_POS_Y;
    if x < width && y < height {
        let idx = y * width + x;
        let base = idx * 3;
        let zero = F::new(0.0);
        let mut valid = x > 0u32 && y > 0u32 && x + 1u32 < width && y + 1u32 < height;

        let mut nx = zero;
        let mut ny = zero;
        let mut nz = zero;
        if valid {
            let l = (idx - 1u32) * 3u32;
            let r = (idx + 1u32) * 3u32;
            let u = (idx - width) * 3u32;
            let d = (idx + width) * 3u32;
            if vertex[l + 2] == zero || vertex[r + 2] == zero || vertex[u + 2] == zero || vertex[d + 2] == zero {
                valid = false;
            } else {
                let ax = vertex[d] - vertex[u];
                let ay = vertex[d + 1] - vertex[u + 1];
                let az = vertex[d + 2] - vertex[u + 2];
                let bx = vertex[r] - vertex[l];
                let by = vertex[r + 1] - vertex[l + 1];
                let bz = vertex[r + 2] - vertex[l + 2];
                nx = ay * bz - az * by;
                ny = az * bx - ax * bz;
                nz = ax * by - ay * bx;
                let len = F::sqrt(nx * nx + ny * ny + nz * nz);
                if len > zero {
                    nx = nx / len;
                    ny = ny / len;
                    nz = nz / len;
                } else {
                    valid = false;
                }
            }
        }

        if valid {
            normal[base] = nx;
            normal[base + 1] = ny;
            normal[base + 2] = nz;
        } else {
            normal[base] = F::new(-2.0);
            normal[base + 1] = zero;
            normal[base + 2] = zero;
        }
    }
}

/// Reset raycast output to the miss state: zero vertex, invalid normal,
/// zero depth.
#[cube(launch_unchecked)]
pub fn clear_surface_kernel<F: Float>(
    width: u32,
    height: u32,
    vertex: &mut Array<F>,
    normal: &mut Array<F>,
    depth: &mut Array<F>,
) {
    let x = ABSOLUTE_POS_X;
    let y = ABSOLUTE_POS_Y;
    if x < width && y < height {
        let idx = y * width + x;
        let base = idx * 3;
        let zero = F::new(0.0);
        vertex[base] = zero;
        vertex[base + 1] = zero;
        vertex[base + 2] = zero;
        normal[base] = F::new(-2.0);
        normal[base + 1] = zero;
        normal[base + 2] = zero;
        depth[idx] = zero;
    }
}

// ---------------------------------------------------------------------------
// Tracking
// ---------------------------------------------------------------------------

/// Linearize pixel `idx` of the current frame into `out[offset..offset + 8]`.
#[cube]
fn track_pixel_into<F: Float>(
    vertex: &Array<F>,
    normal: &Array<F>,
    idx: u32,
    ref_vertex: &Array<F>,
    ref_normal: &Array<F>,
    ref_width: u32,
    ref_height: u32,
    pose: &Array<F>,
    view: &Array<F>,
    dist_threshold: F,
    normal_threshold: F,
    out: &mut Array<F>,
    offset: u32,
) {
    let zero = F::new(0.0);
    let one = F::new(1.0);
    let base = idx * 3;
    let mut status = one;

    for k in 0..RECORD_STRIDE {
        out[offset + k] = zero;
    }

    if normal[base] == F::new(-2.0) {
        status = F::new(-1.0);
    }

    let vx = vertex[base];
    let vy = vertex[base + 1];
    let vz = vertex[base + 2];
    let px = mat_row::<F>(pose, 0, vx, vy, vz, one);
    let py = mat_row::<F>(pose, 1, vx, vy, vz, one);
    let pz = mat_row::<F>(pose, 2, vx, vy, vz, one);

    let mut ref_idx = 0u32;
    if status == one {
        let cx = mat_row::<F>(view, 0, px, py, pz, one);
        let cy = mat_row::<F>(view, 1, px, py, pz, one);
        let cz = mat_row::<F>(view, 2, px, py, pz, one);
        if cz <= zero {
            status = F::new(-2.0);
        } else {
            let u = cx / cz + F::new(0.5);
            let v = cy / cz + F::new(0.5);
            let inside = u >= zero
                && u <= F::cast_from(ref_width - 1u32)
                && v >= zero
                && v <= F::cast_from(ref_height - 1u32);
            if inside {
                ref_idx = u32::cast_from(v) * ref_width + u32::cast_from(u);
            } else {
                status = F::new(-2.0);
            }
        }
    }

    let rb = ref_idx * 3;
    if status == one && ref_normal[rb] == F::new(-2.0) {
        status = F::new(-3.0);
    }

    let diff_x = ref_vertex[rb] - px;
    let diff_y = ref_vertex[rb + 1] - py;
    let diff_z = ref_vertex[rb + 2] - pz;
    if status == one && F::sqrt(diff_x * diff_x + diff_y * diff_y + diff_z * diff_z) > dist_threshold {
        status = F::new(-4.0);
    }

    let rnx = ref_normal[rb];
    let rny = ref_normal[rb + 1];
    let rnz = ref_normal[rb + 2];
    if status == one {
        let nx = mat_row::<F>(pose, 0, normal[base], normal[base + 1], normal[base + 2], zero);
        let ny = mat_row::<F>(pose, 1, normal[base], normal[base + 1], normal[base + 2], zero);
        let nz = mat_row::<F>(pose, 2, normal[base], normal[base + 1], normal[base + 2], zero);
        if nx * rnx + ny * rny + nz * rnz < normal_threshold {
            status = F::new(-5.0);
        }
    }

    out[offset] = status;
    if status == one {
        out[offset + 1] = rnx * diff_x + rny * diff_y + rnz * diff_z;
        out[offset + 2] = rnx;
        out[offset + 3] = rny;
        out[offset + 4] = rnz;
        out[offset + 5] = py * rnz - pz * rny;
        out[offset + 6] = pz * rnx - px * rnz;
        out[offset + 7] = px * rny - py * rnx;
    }
}

#[cube(launch_unchecked)]
pub fn track_kernel<F: Float>(
    vertex: &Array<F>,
    normal: &Array<F>,
    width: u32,
    height: u32,
    ref_vertex: &Array<F>,
    ref_normal: &Array<F>,
    ref_width: u32,
    ref_height: u32,
    pose: &Array<F>,
    view: &Array<F>,
    dist_threshold: F,
    normal_threshold: F,
    records: &mut Array<F>,
) {
    let x = ABSOLUTE_POS_X;
    let y = ABSOLUTE_POS_Y;
    if x < width && y < height {
        let idx = y * width + x;
        track_pixel_into::<F>(
            vertex,
            normal,
            idx,
            ref_vertex,
            ref_normal,
            ref_width,
            ref_height,
            pose,
            view,
            dist_threshold,
            normal_threshold,
            records,
            idx * RECORD_STRIDE,
        );
    }
}

/// Add the record at `records[r..r + 8]` into `sums[s..s + 32]`.
#[cube]
fn accumulate_record<F: Float>(records: &Array<F>, r: u32, sums: &mut Array<F>, s: u32) {
    let status = records[r];
    let one = F::new(1.0);
    if status == one {
        let e = records[r + 1];
        sums[s] += e * e;
        for i in 0..6u32 {
            sums[s + 1 + i] += e * records[r + 2 + i];
        }
        let mut k = 7u32;
        for row in 0..6u32 {
            for col in row..6u32 {
                sums[s + k] += records[r + 2 + row] * records[r + 2 + col];
                k += 1u32;
            }
        }
        sums[s + 28] += one;
    } else if status == F::new(-4.0) {
        sums[s + 29] += one;
    } else if status == F::new(-5.0) {
        sums[s + 30] += one;
    } else {
        sums[s + 31] += one;
    }
}

/// Zero this lane's accumulator slot.
#[cube]
fn clear_slot<F: Float>(sums: &mut Array<F>, s: u32) {
    for k in 0..SYSTEM_STRIDE {
        sums[s + k] = F::new(0.0);
    }
}

/// Fold the lanes of this cube into lane 0 with a halving tree, then copy
/// the group total to `partials[group * 32..]`.
#[cube]
fn tree_fold<F: Float>(
    sums: &mut Array<F>,
    group: u32,
    group_base: u32,
    lane: u32,
    lanes: u32,
    rounds: u32,
    partials: &mut Array<F>,
) {
    for round in 0..rounds {
        let stride = lanes >> (round + 1u32);
        if lane < stride {
            let dst = group_base + lane * SYSTEM_STRIDE;
            let src = group_base + (lane + stride) * SYSTEM_STRIDE;
            for k in 0..SYSTEM_STRIDE {
                sums[dst + k] += sums[src + k];
            }
        }
        sync_cube();
    }
    if lane == 0u32 {
        for k in 0..SYSTEM_STRIDE {
            partials[group * SYSTEM_STRIDE + k] = sums[group_base + k];
        }
    }
}

/// Phase one of the reduction over stored records. One cube per group,
/// one unit per lane. `sums` is scratch for `groups * lanes * 32` floats;
/// `partials` receives `groups * 32` floats, one system per group.
#[cube(launch_unchecked)]
pub fn reduce_kernel<F: Float>(
    records: &Array<F>,
    width: u32,
    height: u32,
    groups: u32,
    lanes: u32,
    rounds: u32,
    sums: &mut Array<F>,
    partials: &mut Array<F>,
) {
    let group = CUBE_POS_X;
    let lane = UNIT_POS_X;
    let group_base = group * lanes * SYSTEM_STRIDE;
    let s = group_base + lane * SYSTEM_STRIDE;
    clear_slot::<F>(sums, s);

    let rows = (height + groups - 1u32 - group) / groups;
    let cols = (width + lanes - 1u32 - lane) / lanes;
    for ry in 0..rows {
        let y = group + ry * groups;
        for cx in 0..cols {
            let x = lane + cx * lanes;
            accumulate_record::<F>(records, (y * width + x) * RECORD_STRIDE, sums, s);
        }
    }
    sync_cube();
    tree_fold::<F>(sums, group, group_base, lane, lanes, rounds, partials);
}

/// Fused linearization and phase-one reduction. `scratch` holds one record
/// slot per unit (`groups * lanes * 8` floats).
#[cube(launch_unchecked)]
pub fn track_reduce_kernel<F: Float>(
    vertex: &Array<F>,
    normal: &Array<F>,
    width: u32,
    height: u32,
    ref_vertex: &Array<F>,
    ref_normal: &Array<F>,
    ref_width: u32,
    ref_height: u32,
    pose: &Array<F>,
    view: &Array<F>,
    dist_threshold: F,
    normal_threshold: F,
    groups: u32,
    lanes: u32,
    rounds: u32,
    scratch: &mut Array<F>,
    sums: &mut Array<F>,
    partials: &mut Array<F>,
) {
    let group = CUBE_POS_X;
    let lane = UNIT_POS_X;
    let group_base = group * lanes * SYSTEM_STRIDE;
    let s = group_base + lane * SYSTEM_STRIDE;
    let r = (group * lanes + lane) * RECORD_STRIDE;
    clear_slot::<F>(sums, s);

    let rows = (height + groups - 1u32 - group) / groups;
    let cols = (width + lanes - 1u32 - lane) / lanes;
    for ry in 0..rows {
        let y = group + ry * groups;
        for cx in 0..cols {
            let x = lane + cx * lanes;
            track_pixel_into::<F>(
                vertex,
                normal,
                y * width + x,
                ref_vertex,
                ref_normal,
                ref_width,
                ref_height,
                pose,
                view,
                dist_threshold,
                normal_threshold,
                scratch,
                r,
            );
            accumulate_record::<F>(scratch, r, sums, s);
        }
    }
    sync_cube();
    tree_fold::<F>(sums, group, group_base, lane, lanes, rounds, partials);
}
