//! Conversion of raw sensor frames into metric depth.

use serde::{Deserialize, Serialize};

use crate::error::{KFusionError, Result};
use crate::image::{Image, ImageSize};
use crate::parallel::{launch_image, WorkGroup};

const KINECT_DISPARITY_SCALE: f32 = -0.003_071_1;
const KINECT_DISPARITY_OFFSET: f32 = 3.330_949_5;
const KINECT_DISPARITY_INVALID: u16 = 2047;

/// Units of integer depth samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RawDepthUnits {
    /// Linear depth; `bits` wide samples at `meters_per_unit`. A zero or
    /// saturated sample means no measurement.
    Linear { bits: u32, meters_per_unit: f32 },
    /// 11-bit Kinect disparity.
    KinectDisparity,
}

impl RawDepthUnits {
    /// Millimeter depth as produced by most structured-light drivers.
    pub const MILLIMETERS: RawDepthUnits = RawDepthUnits::Linear {
        bits: 16,
        meters_per_unit: 1e-3,
    };

    /// Metric depth of one sample; 0 for no measurement.
    #[inline]
    pub fn to_meters(&self, raw: u16) -> f32 {
        match *self {
            RawDepthUnits::Linear {
                bits,
                meters_per_unit,
            } => {
                let saturated = if bits >= 16 {
                    u16::MAX
                } else {
                    ((1u32 << bits) - 1) as u16
                };
                if raw == 0 || raw >= saturated {
                    0.0
                } else {
                    raw as f32 * meters_per_unit
                }
            }
            RawDepthUnits::KinectDisparity => {
                if raw >= KINECT_DISPARITY_INVALID {
                    return 0.0;
                }
                let depth = 1.0 / (raw as f32 * KINECT_DISPARITY_SCALE + KINECT_DISPARITY_OFFSET);
                if depth > 0.0 && depth.is_finite() {
                    depth
                } else {
                    0.0
                }
            }
        }
    }
}

/// A depth frame handed to the pipeline.
#[derive(Debug, Clone, Copy)]
pub enum DepthInput<'a> {
    /// Integer samples in host memory.
    HostRaw {
        samples: &'a [u16],
        size: ImageSize,
        units: RawDepthUnits,
    },
    /// Metric depth in host memory; non-positive and non-finite values mean
    /// no measurement.
    HostMetric { depth: &'a [f32], size: ImageSize },
    /// Metric depth already resident on the device.
    #[cfg(feature = "cuda")]
    Device(&'a crate::gpu::DeviceDepth),
}

impl DepthInput<'_> {
    pub fn size(&self) -> ImageSize {
        match self {
            DepthInput::HostRaw { size, .. } | DepthInput::HostMetric { size, .. } => *size,
            #[cfg(feature = "cuda")]
            DepthInput::Device(d) => d.size(),
        }
    }
}

/// Sampling stride that maps `input` onto `render`: 1 or 2.
pub fn input_stride(input: ImageSize, render: ImageSize) -> Result<u32> {
    if input == render {
        Ok(1)
    } else if input == render.double() {
        Ok(2)
    } else {
        Err(KFusionError::DimensionMismatch {
            expected: render,
            actual: input,
        })
    }
}

fn check_len(len: usize, size: ImageSize) -> Result<()> {
    if len != size.pixel_count() {
        return Err(KFusionError::BufferLength {
            expected: size.pixel_count(),
            actual: len,
        });
    }
    Ok(())
}

/// Convert host integer samples into `out`, taking every `stride`-th pixel.
pub fn ingest_raw(
    out: &mut Image<f32>,
    samples: &[u16],
    size: ImageSize,
    units: RawDepthUnits,
    block: WorkGroup,
) -> Result<()> {
    check_len(samples.len(), size)?;
    let stride = input_stride(size, out.size())?;
    launch_image(out, block, |x, y| {
        units.to_meters(samples[size.index(x * stride, y * stride)])
    });
    Ok(())
}

/// Copy host metric depth into `out`, taking every `stride`-th pixel.
pub fn ingest_metric(out: &mut Image<f32>, depth: &[f32], size: ImageSize, block: WorkGroup) -> Result<()> {
    check_len(depth.len(), size)?;
    let stride = input_stride(size, out.size())?;
    launch_image(out, block, |x, y| {
        let d = depth[size.index(x * stride, y * stride)];
        if d > 0.0 && d.is_finite() {
            d
        } else {
            0.0
        }
    });
    Ok(())
}
