//! GPU runtime for the fusion kernels.
//!
//! The TSDF volume lives in a [`DeviceVolume`] and every per-frame image in
//! a [`DeviceMaps`]; both are allocated once and stay on the device. Stages
//! run handle to handle. Per frame the host uploads at most the converted
//! input depth, and per ICP iteration it uploads two 4x4 matrices and reads
//! back one reduced system per work group.
//!
//! Per-pixel kernels are launched as 2D grids with the configured work-group
//! shape. Volume kernels use the [`VolumeLaunch`] chosen for the volume.

use anyhow::{ensure, Result};
use cubecl::client::ComputeClient;
use cubecl::cuda::{CudaDevice, CudaRuntime};
use cubecl::prelude::*;
use cubecl::server::Handle;

use super::kernels::{
    bilateral_kernel, clear_surface_kernel, depth_to_vertex_kernel, half_sample_kernel,
    ingest_depth_kernel, init_volume_kernel, integrate_kernel, raycast_kernel, reduce_kernel,
    track_kernel, track_reduce_kernel, vertex_to_normal_kernel, RECORD_STRIDE, SYSTEM_STRIDE,
};
use super::maps::{DeviceImage, DeviceMaps};
use crate::image::{Image, ImageSize};
use crate::integrate::IntegrateParams;
use crate::parallel::{VolumeLaunch, WorkGroup};
use crate::preprocess::input_stride;
use crate::raycast::RaycastParams;
use crate::tracking::{
    combine_partials, LinearSystem, TrackParams, TrackRecord, TrackStatus, REDUCTION_WIDTH,
};
use crate::transform::{Float3, Matrix4};
use crate::volume::{HostVolume, PackedVoxel};

/// Type alias for CUDA compute client
type CudaClient = ComputeClient<<CudaRuntime as Runtime>::Server>;

/// Metric depth image resident on the device, as handed in by a caller that
/// already holds its frames in GPU memory.
pub struct DeviceDepth {
    handle: Handle,
    size: ImageSize,
}

impl DeviceDepth {
    pub fn size(&self) -> ImageSize {
        self.size
    }
}

/// Packed TSDF volume resident on the device.
///
/// Same column-contiguous layout and voxel encoding as
/// [`crate::volume::Volume`]. The launch shape is fixed at creation and used
/// by every pass over the volume.
pub struct DeviceVolume {
    handle: Handle,
    size: [u32; 3],
    dim: Float3,
    launch: VolumeLaunch,
}

impl DeviceVolume {
    pub fn size(&self) -> [u32; 3] {
        self.size
    }

    pub fn dim(&self) -> Float3 {
        self.dim
    }

    pub fn launch(&self) -> &VolumeLaunch {
        &self.launch
    }

    fn len(&self) -> usize {
        self.size.iter().map(|&s| s as usize).product()
    }
}

/// CUDA device and client shared by every stage of one pipeline.
pub struct GpuRuntime {
    /// CUDA device (kept alive for runtime lifetime)
    #[allow(dead_code)]
    device: CudaDevice,
    client: CudaClient,
}

fn unflatten(values: &[f32]) -> Vec<Float3> {
    values
        .chunks_exact(3)
        .map(|c| Float3::new(c[0], c[1], c[2]))
        .collect()
}

/// 2D grid covering `size` with `block`-shaped cubes.
fn image_cubes(size: ImageSize, block: WorkGroup) -> (CubeCount, CubeDim) {
    let bx = block.x.max(1);
    let by = block.y.max(1);
    (
        CubeCount::Static(size.width.div_ceil(bx).max(1), size.height.div_ceil(by).max(1), 1),
        CubeDim::new(bx, by, 1),
    )
}

/// One unit per (x, y) column of the volume.
fn column_cubes(launch: &VolumeLaunch) -> (CubeCount, CubeDim) {
    let VolumeLaunch { block, grid } = *launch;
    (
        CubeCount::Static(grid.x, grid.y, 1),
        CubeDim::new(block.x, block.y, 1),
    )
}

/// One unit per voxel.
fn voxel_cubes(launch: &VolumeLaunch) -> (CubeCount, CubeDim) {
    let VolumeLaunch { block, grid } = *launch;
    (
        CubeCount::Static(grid.x, grid.y, grid.z),
        CubeDim::new(block.x, block.y, block.z),
    )
}

impl GpuRuntime {
    /// Create a new GPU runtime with the default CUDA device.
    pub fn new() -> Result<Self> {
        Self::with_device_id(0)
    }

    pub fn with_device_id(device_id: usize) -> Result<Self> {
        let device = CudaDevice::new(device_id);
        let client = CudaRuntime::client(&device);
        Ok(Self { device, client })
    }

    pub fn client(&self) -> &CudaClient {
        &self.client
    }

    fn upload_f32(&self, values: &[f32]) -> Handle {
        self.client.create(f32::as_bytes(values))
    }

    fn read_f32(&self, handle: &Handle) -> Vec<f32> {
        let bytes = self.client.read_one(handle.clone());
        f32::from_bytes(&bytes).to_vec()
    }

    fn upload_matrix(&self, m: &Matrix4) -> Handle {
        self.upload_f32(&m.to_row_major())
    }

    // -----------------------------------------------------------------------
    // Depth input
    // -----------------------------------------------------------------------

    pub fn upload_depth(&self, depth: &[f32], size: ImageSize) -> Result<DeviceDepth> {
        ensure!(
            depth.len() == size.pixel_count(),
            "depth buffer holds {} samples, {size} needs {}",
            depth.len(),
            size.pixel_count()
        );
        Ok(DeviceDepth {
            handle: self.upload_f32(depth),
            size,
        })
    }

    pub fn read_depth(&self, depth: &DeviceDepth) -> Result<Vec<f32>> {
        Ok(self.read_f32(&depth.handle))
    }

    /// Replace the input buffer with host depth already converted to
    /// meters at render size.
    pub fn load_depth(&self, maps: &mut DeviceMaps, depth: &Image<f32>) -> Result<()> {
        ensure!(
            depth.size() == maps.raw_depth.size(),
            "depth is {}, pipeline renders at {}",
            depth.size(),
            maps.raw_depth.size()
        );
        maps.raw_depth.handle = self.upload_f32(depth.as_slice());
        Ok(())
    }

    /// Copy device-resident depth into the input buffer, subsampling full
    /// frames down to render size.
    pub fn ingest_depth(&self, maps: &mut DeviceMaps, depth: &DeviceDepth, block: WorkGroup) -> Result<()> {
        let render = maps.raw_depth.size();
        let stride = input_stride(depth.size, render)?;
        let (count, dim) = image_cubes(render, block);
        unsafe {
            ingest_depth_kernel::launch_unchecked::<f32, CudaRuntime>(
                &self.client,
                count,
                dim,
                ArrayArg::from_raw_parts::<f32>(&depth.handle, depth.size.pixel_count(), 1),
                ScalarArg::new(depth.size.width),
                ScalarArg::new(stride),
                ScalarArg::new(render.width),
                ScalarArg::new(render.height),
                ArrayArg::from_raw_parts::<f32>(&maps.raw_depth.handle, maps.raw_depth.len(), 1),
            );
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Downloads
    // -----------------------------------------------------------------------

    fn download_scalar(&self, image: &DeviceImage) -> Result<Image<f32>> {
        ensure!(image.channels() == 1, "expected a scalar image, found {} channels", image.channels());
        Ok(Image::from_vec(image.size(), self.read_f32(&image.handle))?)
    }

    fn download_vectors(&self, image: &DeviceImage) -> Result<Image<Float3>> {
        ensure!(image.channels() == 3, "expected a vector image, found {} channels", image.channels());
        Ok(Image::from_vec(image.size(), unflatten(&self.read_f32(&image.handle)))?)
    }

    /// Metric input depth at render size.
    pub fn download_input(&self, maps: &DeviceMaps) -> Result<Image<f32>> {
        self.download_scalar(&maps.raw_depth)
    }

    /// Filtered depth of one pyramid level.
    pub fn download_level_depth(&self, maps: &DeviceMaps, level: usize) -> Result<Image<f32>> {
        self.download_scalar(&maps.levels[level].depth)
    }

    /// Camera-frame vertex and normal maps of one pyramid level.
    pub fn download_level_geometry(&self, maps: &DeviceMaps, level: usize) -> Result<(Image<Float3>, Image<Float3>)> {
        let level = &maps.levels[level];
        Ok((self.download_vectors(&level.vertex)?, self.download_vectors(&level.normal)?))
    }

    /// Raycast vertex, normal, and depth maps.
    pub fn download_surface(&self, maps: &DeviceMaps) -> Result<(Image<Float3>, Image<Float3>, Image<f32>)> {
        let surface = &maps.surface;
        Ok((
            self.download_vectors(&surface.vertex)?,
            self.download_vectors(&surface.normal)?,
            self.download_scalar(&surface.depth)?,
        ))
    }

    /// Records of the last per-pixel linearization of `level`, if the maps
    /// were allocated for per-pixel tracking.
    pub fn download_records(&self, maps: &DeviceMaps, level: usize) -> Result<Option<Image<TrackRecord>>> {
        let Some(records) = &maps.levels[level].records else {
            return Ok(None);
        };
        let flat = self.read_f32(&records.handle);
        let decoded = flat
            .chunks_exact(RECORD_STRIDE as usize)
            .map(decode_record)
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(Image::from_vec(records.size(), decoded)?))
    }

    // -----------------------------------------------------------------------
    // Volume
    // -----------------------------------------------------------------------

    pub fn create_volume(&self, size: [u32; 3], dim: [f32; 3], launch: VolumeLaunch) -> Result<DeviceVolume> {
        let len = size.iter().map(|&s| s as usize).product::<usize>();
        let volume = DeviceVolume {
            handle: self.client.empty(len * std::mem::size_of::<u32>()),
            size,
            dim: Float3::new(dim[0], dim[1], dim[2]),
            launch,
        };
        self.reset_volume(&volume)?;
        Ok(volume)
    }

    pub fn reset_volume(&self, volume: &DeviceVolume) -> Result<()> {
        let [sx, sy, sz] = volume.size;
        let (count, dim) = voxel_cubes(&volume.launch);
        unsafe {
            init_volume_kernel::launch_unchecked::<CudaRuntime>(
                &self.client,
                count,
                dim,
                ArrayArg::from_raw_parts::<u32>(&volume.handle, volume.len(), 1),
                ScalarArg::new(sx),
                ScalarArg::new(sy),
                ScalarArg::new(sz),
                ScalarArg::new(PackedVoxel::EMPTY.0),
            );
        }
        Ok(())
    }

    pub fn download_volume(&self, volume: &DeviceVolume) -> Result<HostVolume> {
        let bytes = self.client.read_one(volume.handle.clone());
        let packed: Vec<PackedVoxel> = u32::from_bytes(&bytes).iter().map(|&v| PackedVoxel(v)).collect();
        ensure!(packed.len() == volume.len(), "volume download returned {} voxels", packed.len());
        Ok(HostVolume::from_packed(volume.size, volume.dim, &packed))
    }

    /// Fuse the input depth in `maps` into `volume`.
    pub fn integrate(
        &self,
        volume: &DeviceVolume,
        maps: &DeviceMaps,
        inv_pose: &Matrix4,
        k: &Matrix4,
        params: IntegrateParams,
    ) -> Result<()> {
        let [sx, sy, sz] = volume.size;
        let depth = &maps.raw_depth;
        let inv_pose_gpu = self.upload_matrix(inv_pose);
        let k_gpu = self.upload_matrix(k);
        let (count, dim) = column_cubes(&volume.launch);

        unsafe {
            integrate_kernel::launch_unchecked::<f32, CudaRuntime>(
                &self.client,
                count,
                dim,
                ArrayArg::from_raw_parts::<u32>(&volume.handle, volume.len(), 1),
                ScalarArg::new(sx),
                ScalarArg::new(sy),
                ScalarArg::new(sz),
                ScalarArg::new(volume.dim.x / sx as f32),
                ScalarArg::new(volume.dim.y / sy as f32),
                ScalarArg::new(volume.dim.z / sz as f32),
                ArrayArg::from_raw_parts::<f32>(&depth.handle, depth.len(), 1),
                ScalarArg::new(depth.size().width),
                ScalarArg::new(depth.size().height),
                ArrayArg::from_raw_parts::<f32>(&inv_pose_gpu, 16, 1),
                ArrayArg::from_raw_parts::<f32>(&k_gpu, 16, 1),
                ScalarArg::new(params.mu),
                ScalarArg::new(params.max_weight),
            );
        }
        Ok(())
    }

    /// Raycast `volume` through `view` into the reference surface of `maps`.
    pub fn raycast(
        &self,
        volume: &DeviceVolume,
        maps: &mut DeviceMaps,
        view: &Matrix4,
        params: &RaycastParams,
        block: WorkGroup,
    ) -> Result<()> {
        let [sx, sy, sz] = volume.size;
        let surface = &maps.surface;
        let size = surface.depth.size();
        let view_gpu = self.upload_matrix(view);
        let max_steps = ((params.far_plane - params.near_plane) / params.step.min(params.large_step))
            .ceil()
            .max(1.0) as u32
            + 2;
        let (count, dim) = image_cubes(size, block);

        unsafe {
            raycast_kernel::launch_unchecked::<f32, CudaRuntime>(
                &self.client,
                count,
                dim,
                ArrayArg::from_raw_parts::<u32>(&volume.handle, volume.len(), 1),
                ScalarArg::new(sx),
                ScalarArg::new(sy),
                ScalarArg::new(sz),
                ScalarArg::new(volume.dim.x),
                ScalarArg::new(volume.dim.y),
                ScalarArg::new(volume.dim.z),
                ArrayArg::from_raw_parts::<f32>(&view_gpu, 16, 1),
                ScalarArg::new(size.width),
                ScalarArg::new(size.height),
                ScalarArg::new(params.near_plane),
                ScalarArg::new(params.far_plane),
                ScalarArg::new(params.step),
                ScalarArg::new(params.large_step),
                ScalarArg::new(max_steps),
                ArrayArg::from_raw_parts::<f32>(&surface.vertex.handle, surface.vertex.len(), 1),
                ArrayArg::from_raw_parts::<f32>(&surface.normal.handle, surface.normal.len(), 1),
                ArrayArg::from_raw_parts::<f32>(&surface.depth.handle, surface.depth.len(), 1),
            );
        }
        Ok(())
    }

    /// Put the reference surface into the all-miss state.
    pub fn clear_surface(&self, maps: &mut DeviceMaps, block: WorkGroup) {
        let surface = &maps.surface;
        let size = surface.depth.size();
        let (count, dim) = image_cubes(size, block);
        unsafe {
            clear_surface_kernel::launch_unchecked::<f32, CudaRuntime>(
                &self.client,
                count,
                dim,
                ScalarArg::new(size.width),
                ScalarArg::new(size.height),
                ArrayArg::from_raw_parts::<f32>(&surface.vertex.handle, surface.vertex.len(), 1),
                ArrayArg::from_raw_parts::<f32>(&surface.normal.handle, surface.normal.len(), 1),
                ArrayArg::from_raw_parts::<f32>(&surface.depth.handle, surface.depth.len(), 1),
            );
        }
    }

    // -----------------------------------------------------------------------
    // Preprocessing
    // -----------------------------------------------------------------------

    /// Bilateral-filter the input into level 0, half-sample the coarser
    /// levels, and rebuild every level's vertex and normal maps.
    pub fn preprocess(&self, maps: &mut DeviceMaps, e_delta: f32, radius: u32, block: WorkGroup) -> Result<()> {
        ensure!(!maps.levels.is_empty(), "device maps have no pyramid levels");
        self.bilateral_filter(maps, e_delta, radius, block);
        for level in 1..maps.levels.len() {
            self.half_sample(maps, level, 3.0 * e_delta, block);
        }
        for level in 0..maps.levels.len() {
            self.depth_geometry(maps, level, block);
        }
        Ok(())
    }

    fn bilateral_filter(&self, maps: &DeviceMaps, e_delta: f32, radius: u32, block: WorkGroup) {
        let input = &maps.raw_depth;
        let output = &maps.levels[0].depth;
        let size = input.size();
        let (count, dim) = image_cubes(size, block);

        unsafe {
            bilateral_kernel::launch_unchecked::<f32, CudaRuntime>(
                &self.client,
                count,
                dim,
                ArrayArg::from_raw_parts::<f32>(&input.handle, input.len(), 1),
                ScalarArg::new(size.width),
                ScalarArg::new(size.height),
                ArrayArg::from_raw_parts::<f32>(&maps.gaussian, maps.gaussian_len, 1),
                ScalarArg::new(e_delta),
                ScalarArg::new(radius),
                ArrayArg::from_raw_parts::<f32>(&output.handle, output.len(), 1),
            );
        }
    }

    /// Level `level` from level `level - 1`.
    fn half_sample(&self, maps: &DeviceMaps, level: usize, e_d: f32, block: WorkGroup) {
        let input = &maps.levels[level - 1].depth;
        let output = &maps.levels[level].depth;
        let out_size = output.size();
        let (count, dim) = image_cubes(out_size, block);

        unsafe {
            half_sample_kernel::launch_unchecked::<f32, CudaRuntime>(
                &self.client,
                count,
                dim,
                ArrayArg::from_raw_parts::<f32>(&input.handle, input.len(), 1),
                ScalarArg::new(out_size.width),
                ScalarArg::new(out_size.height),
                ScalarArg::new(e_d),
                ArrayArg::from_raw_parts::<f32>(&output.handle, output.len(), 1),
            );
        }
    }

    fn depth_geometry(&self, maps: &DeviceMaps, level: usize, block: WorkGroup) {
        let level = &maps.levels[level];
        let size = level.depth.size();

        unsafe {
            let (count, dim) = image_cubes(size, block);
            depth_to_vertex_kernel::launch_unchecked::<f32, CudaRuntime>(
                &self.client,
                count,
                dim,
                ArrayArg::from_raw_parts::<f32>(&level.depth.handle, level.depth.len(), 1),
                ScalarArg::new(size.width),
                ScalarArg::new(size.height),
                ArrayArg::from_raw_parts::<f32>(&level.inv_k, 16, 1),
                ArrayArg::from_raw_parts::<f32>(&level.vertex.handle, level.vertex.len(), 1),
            );
            let (count, dim) = image_cubes(size, block);
            vertex_to_normal_kernel::launch_unchecked::<f32, CudaRuntime>(
                &self.client,
                count,
                dim,
                ArrayArg::from_raw_parts::<f32>(&level.vertex.handle, level.vertex.len(), 1),
                ScalarArg::new(size.width),
                ScalarArg::new(size.height),
                ArrayArg::from_raw_parts::<f32>(&level.normal.handle, level.normal.len(), 1),
            );
        }
    }

    // -----------------------------------------------------------------------
    // Tracking
    // -----------------------------------------------------------------------

    /// Reduced point-to-plane system of pyramid level `level` at `pose`
    /// against the reference surface seen through `view`.
    ///
    /// With per-pixel records allocated this runs the track kernel followed
    /// by the reduction; otherwise the fused kernel. Only the per-group
    /// partial systems are read back.
    pub fn linearize(
        &self,
        maps: &DeviceMaps,
        level: usize,
        pose: &Matrix4,
        view: &Matrix4,
        params: &TrackParams,
        block: WorkGroup,
    ) -> Result<LinearSystem> {
        ensure!(level < maps.levels.len(), "no pyramid level {level}");
        let current = &maps.levels[level];
        let surface = &maps.surface;
        let size = current.depth.size();
        let ref_size = surface.depth.size();
        let layout = maps.layout;
        let units = (layout.groups * layout.lanes) as usize;
        let sums_len = units * SYSTEM_STRIDE as usize;
        let partials_len = layout.groups as usize * SYSTEM_STRIDE as usize;
        let pose_gpu = self.upload_matrix(pose);
        let view_gpu = self.upload_matrix(view);

        match &current.records {
            Some(records) => unsafe {
                let (count, dim) = image_cubes(size, block);
                track_kernel::launch_unchecked::<f32, CudaRuntime>(
                    &self.client,
                    count,
                    dim,
                    ArrayArg::from_raw_parts::<f32>(&current.vertex.handle, current.vertex.len(), 1),
                    ArrayArg::from_raw_parts::<f32>(&current.normal.handle, current.normal.len(), 1),
                    ScalarArg::new(size.width),
                    ScalarArg::new(size.height),
                    ArrayArg::from_raw_parts::<f32>(&surface.vertex.handle, surface.vertex.len(), 1),
                    ArrayArg::from_raw_parts::<f32>(&surface.normal.handle, surface.normal.len(), 1),
                    ScalarArg::new(ref_size.width),
                    ScalarArg::new(ref_size.height),
                    ArrayArg::from_raw_parts::<f32>(&pose_gpu, 16, 1),
                    ArrayArg::from_raw_parts::<f32>(&view_gpu, 16, 1),
                    ScalarArg::new(params.dist_threshold),
                    ScalarArg::new(params.normal_threshold),
                    ArrayArg::from_raw_parts::<f32>(&records.handle, records.len(), 1),
                );
                reduce_kernel::launch_unchecked::<f32, CudaRuntime>(
                    &self.client,
                    CubeCount::Static(layout.groups, 1, 1),
                    CubeDim::new(layout.lanes, 1, 1),
                    ArrayArg::from_raw_parts::<f32>(&records.handle, records.len(), 1),
                    ScalarArg::new(size.width),
                    ScalarArg::new(size.height),
                    ScalarArg::new(layout.groups),
                    ScalarArg::new(layout.lanes),
                    ScalarArg::new(layout.lanes.trailing_zeros()),
                    ArrayArg::from_raw_parts::<f32>(&maps.sums, sums_len, 1),
                    ArrayArg::from_raw_parts::<f32>(&maps.partials, partials_len, 1),
                );
            },
            None => unsafe {
                track_reduce_kernel::launch_unchecked::<f32, CudaRuntime>(
                    &self.client,
                    CubeCount::Static(layout.groups, 1, 1),
                    CubeDim::new(layout.lanes, 1, 1),
                    ArrayArg::from_raw_parts::<f32>(&current.vertex.handle, current.vertex.len(), 1),
                    ArrayArg::from_raw_parts::<f32>(&current.normal.handle, current.normal.len(), 1),
                    ScalarArg::new(size.width),
                    ScalarArg::new(size.height),
                    ArrayArg::from_raw_parts::<f32>(&surface.vertex.handle, surface.vertex.len(), 1),
                    ArrayArg::from_raw_parts::<f32>(&surface.normal.handle, surface.normal.len(), 1),
                    ScalarArg::new(ref_size.width),
                    ScalarArg::new(ref_size.height),
                    ArrayArg::from_raw_parts::<f32>(&pose_gpu, 16, 1),
                    ArrayArg::from_raw_parts::<f32>(&view_gpu, 16, 1),
                    ScalarArg::new(params.dist_threshold),
                    ScalarArg::new(params.normal_threshold),
                    ScalarArg::new(layout.groups),
                    ScalarArg::new(layout.lanes),
                    ScalarArg::new(layout.lanes.trailing_zeros()),
                    ArrayArg::from_raw_parts::<f32>(&maps.scratch, units * RECORD_STRIDE as usize, 1),
                    ArrayArg::from_raw_parts::<f32>(&maps.sums, sums_len, 1),
                    ArrayArg::from_raw_parts::<f32>(&maps.partials, partials_len, 1),
                );
            },
        }
        Ok(self.combine(maps))
    }

    /// Phase two on the host: sum the group partials in group order.
    fn combine(&self, maps: &DeviceMaps) -> LinearSystem {
        let partials: Vec<LinearSystem> = self
            .read_f32(&maps.partials)
            .chunks_exact(SYSTEM_STRIDE as usize)
            .map(|group| {
                let mut system = LinearSystem::zeros();
                system.values.copy_from_slice(&group[..REDUCTION_WIDTH]);
                system
            })
            .collect();
        combine_partials(&partials)
    }

    /// Overwrite the reference surface with host maps.
    #[cfg(test)]
    pub(crate) fn upload_surface(&self, maps: &mut DeviceMaps, vertex: &Image<Float3>, normal: &Image<Float3>) {
        maps.surface.vertex.handle = self.upload_f32(&flatten(vertex));
        maps.surface.normal.handle = self.upload_f32(&flatten(normal));
    }

    /// Overwrite one pyramid level's geometry with host maps.
    #[cfg(test)]
    pub(crate) fn upload_level(&self, maps: &mut DeviceMaps, level: usize, vertex: &Image<Float3>, normal: &Image<Float3>) {
        maps.levels[level].vertex.handle = self.upload_f32(&flatten(vertex));
        maps.levels[level].normal.handle = self.upload_f32(&flatten(normal));
    }
}

#[cfg(test)]
fn flatten(image: &Image<Float3>) -> Vec<f32> {
    image.as_slice().iter().flat_map(|p| [p.x, p.y, p.z]).collect()
}

fn decode_record(values: &[f32]) -> Result<TrackRecord> {
    let code = values[0] as i32;
    let status = TrackStatus::from_code(code).ok_or_else(|| anyhow::anyhow!("invalid track status {code}"))?;
    Ok(TrackRecord {
        status,
        error: values[1],
        jacobian: [values[2], values[3], values[4], values[5], values[6], values[7]],
    })
}

/// Check if CUDA is available on this system.
pub fn is_cuda_available() -> bool {
    std::panic::catch_unwind(|| {
        let _device = CudaDevice::new(0);
    })
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KFusionConfig, TrackingMode};
    use crate::preprocess::{bilateral_filter, gaussian_kernel, DepthPyramid};
    use crate::test_utils::{corner_scene, pose_from_euler, reference_maps, test_config};
    use crate::tracking::{reduce, track, ReferenceFrame};
    use approx::assert_relative_eq;

    macro_rules! require_cuda {
        () => {
            if !is_cuda_available() {
                crate::test_println!("Skipping test: CUDA not available");
                return;
            }
        };
    }

    fn start_pose() -> Matrix4 {
        pose_from_euler(Float3::new(1.0, 1.0, 0.0), 0.0, 0.0, 0.0)
    }

    fn scene_depth(config: &KFusionConfig) -> Image<f32> {
        corner_scene().render_depth(&start_pose(), &config.camera, config.render_size())
    }

    #[test]
    fn test_cuda_availability() {
        let _available = is_cuda_available();
        crate::test_println!("CUDA available: {_available}");
    }

    #[test]
    fn test_bilateral_matches_cpu() {
        require_cuda!();
        let runtime = GpuRuntime::new().expect("Failed to create GPU runtime");
        let config = test_config();
        let depth = scene_depth(&config);
        let mut maps = DeviceMaps::allocate(&runtime, &config).unwrap();
        runtime.load_depth(&mut maps, &depth).unwrap();
        runtime
            .preprocess(&mut maps, config.e_delta, config.radius, config.image_block)
            .unwrap();

        let gpu = runtime.download_level_depth(&maps, 0).unwrap();
        let gaussian = gaussian_kernel(config.delta, config.radius);
        let mut cpu = Image::new(depth.size(), 0.0);
        bilateral_filter(&mut cpu, &depth, &gaussian, config.e_delta, config.radius, config.image_block);
        for (a, b) in gpu.as_slice().iter().zip(cpu.as_slice()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_work_group_shape_does_not_change_output() {
        require_cuda!();
        let runtime = GpuRuntime::new().expect("Failed to create GPU runtime");
        let config = test_config();
        let depth = scene_depth(&config);
        let mut maps = DeviceMaps::allocate(&runtime, &config).unwrap();
        runtime.load_depth(&mut maps, &depth).unwrap();

        runtime.preprocess(&mut maps, config.e_delta, config.radius, WorkGroup::new(20, 20, 1)).unwrap();
        let square = runtime.download_level_geometry(&maps, 1).unwrap();
        runtime.preprocess(&mut maps, config.e_delta, config.radius, WorkGroup::new(64, 3, 1)).unwrap();
        let wide = runtime.download_level_geometry(&maps, 1).unwrap();
        assert_eq!(square.0.as_slice(), wide.0.as_slice());
        assert_eq!(square.1.as_slice(), wide.1.as_slice());
    }

    #[test]
    fn test_device_ingest_subsamples_full_frames() {
        require_cuda!();
        let runtime = GpuRuntime::new().expect("Failed to create GPU runtime");
        let config = test_config();
        let render = config.render_size();
        let full = render.double();
        let samples: Vec<f32> = (0..full.pixel_count()).map(|i| 0.5 + (i % full.width as usize) as f32 * 1e-3).collect();
        let device = runtime.upload_depth(&samples, full).unwrap();
        assert_eq!(runtime.read_depth(&device).unwrap(), samples);

        let mut maps = DeviceMaps::allocate(&runtime, &config).unwrap();
        runtime.ingest_depth(&mut maps, &device, config.image_block).unwrap();
        let ingested = runtime.download_input(&maps).unwrap();
        assert_relative_eq!(ingested.get(7, 3), samples[full.index(14, 6)]);

        let wrong = runtime.upload_depth(&vec![1.0; 100], ImageSize::new(10, 10)).unwrap();
        assert!(runtime.ingest_depth(&mut maps, &wrong, config.image_block).is_err());
    }

    #[test]
    fn test_volume_reset_and_integrate() {
        require_cuda!();
        let runtime = GpuRuntime::new().expect("Failed to create GPU runtime");
        let config = test_config();
        let volume = runtime
            .create_volume(config.volume_size, config.volume_dimensions, config.volume_launch())
            .unwrap();
        assert_eq!(runtime.download_volume(&volume).unwrap().observed_count(), 0);

        let mut maps = DeviceMaps::allocate(&runtime, &config).unwrap();
        runtime.load_depth(&mut maps, &scene_depth(&config)).unwrap();
        let params = IntegrateParams {
            mu: config.mu,
            max_weight: config.max_weight,
        };
        runtime
            .integrate(&volume, &maps, &start_pose().inverse_rigid(), &config.camera.matrix(), params)
            .unwrap();
        assert!(runtime.download_volume(&volume).unwrap().observed_count() > 0);

        let view = start_pose() * config.camera.inverse_matrix();
        let params = RaycastParams {
            near_plane: config.near_plane,
            far_plane: config.far_plane,
            step: config.step_size(),
            large_step: config.large_step(),
        };
        runtime.raycast(&volume, &mut maps, &view, &params, config.raycast_block).unwrap();
        let (_, _, depth) = runtime.download_surface(&maps).unwrap();
        let hits = depth.as_slice().iter().filter(|&&d| d > 0.0).count();
        assert!(hits > config.render_size().pixel_count() / 2);

        runtime.clear_surface(&mut maps, config.raycast_block);
        let (_, _, depth) = runtime.download_surface(&maps).unwrap();
        assert!(depth.as_slice().iter().all(|&d| d == 0.0));

        runtime.reset_volume(&volume).unwrap();
        assert_eq!(runtime.download_volume(&volume).unwrap().observed_count(), 0);
    }

    fn tracking_matches_cpu(mode: TrackingMode) {
        let runtime = GpuRuntime::new().expect("Failed to create GPU runtime");
        let mut config = test_config();
        config.tracking_mode = mode;
        let pose = start_pose();
        let (ref_vertex, ref_normal) = reference_maps(&corner_scene(), &pose, &config.camera, config.render_size());
        let mut pyramid = DepthPyramid::allocate(config.render_size(), 1).unwrap();
        pyramid.depth[0].copy_from(&scene_depth(&config)).unwrap();
        pyramid.build_geometry(&config.camera, config.image_block);

        let mut maps = DeviceMaps::allocate(&runtime, &config).unwrap();
        runtime.upload_surface(&mut maps, &ref_vertex, &ref_normal);
        runtime.upload_level(&mut maps, 0, &pyramid.vertex[0], &pyramid.normal[0]);

        let view = config.camera.matrix() * pose.inverse_rigid();
        let reference = ReferenceFrame {
            vertex: &ref_vertex,
            normal: &ref_normal,
            view,
        };
        let params = TrackParams {
            dist_threshold: config.dist_threshold,
            normal_threshold: config.normal_threshold,
        };
        let nudged = crate::transform::se3_exp(&nalgebra::Vector6::new(0.004, 0.0, -0.003, 0.0, 0.002, 0.0)) * pose;

        let mut cpu_records = Image::new(config.render_size(), TrackRecord::default());
        track(&mut cpu_records, &pyramid.vertex[0], &pyramid.normal[0], &reference, &nudged, &params, config.image_block);
        let cpu = reduce(&cpu_records, config.reduce_layout);
        let gpu = runtime
            .linearize(&maps, 0, &nudged, &view, &params, config.image_block)
            .unwrap();
        let diff = cpu.valid_count() as i64 - gpu.valid_count() as i64;
        assert!(diff.abs() < 100, "cpu {} gpu {}", cpu.valid_count(), gpu.valid_count());
        assert_relative_eq!(cpu.error_sum(), gpu.error_sum(), max_relative = 5e-2);

        if let Some(gpu_records) = runtime.download_records(&maps, 0).unwrap() {
            let agree = cpu_records
                .as_slice()
                .iter()
                .zip(gpu_records.as_slice())
                .filter(|(a, b)| a.status == b.status)
                .count();
            assert!(agree as f32 > 0.99 * cpu_records.size().pixel_count() as f32);
        } else {
            assert_eq!(mode, TrackingMode::Fused);
        }
    }

    #[test]
    fn test_per_pixel_tracking_matches_cpu() {
        require_cuda!();
        tracking_matches_cpu(TrackingMode::PerPixel);
    }

    #[test]
    fn test_fused_tracking_matches_cpu() {
        require_cuda!();
        tracking_matches_cpu(TrackingMode::Fused);
    }
}
