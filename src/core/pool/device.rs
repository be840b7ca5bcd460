//! Device placement for engine handles.
//!
//! Placement is deterministic per instance index so that a pool of N
//! handles spreads evenly over the visible GPUs, and so that the effective
//! pool cap respects the hardware it runs on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Compute device an engine handle is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    /// CUDA device with its ordinal.
    Cuda(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{}", index),
        }
    }
}

/// Numeric precision the handle runs inference with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComputeType {
    Float32,
    Float16,
}

impl ComputeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeType::Float32 => "float32",
            ComputeType::Float16 => "float16",
        }
    }
}

/// Device binding handed to the engine factory for one handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAllocation {
    pub device: Device,
    pub compute_type: ComputeType,
}

/// Number of visible GPUs.
///
/// A non-negative configuration override wins; otherwise the count comes
/// from `CUDA_VISIBLE_DEVICES` (empty or unset means CPU-only).
pub fn visible_gpu_count(configured: i32) -> usize {
    if configured >= 0 {
        return configured as usize;
    }
    match std::env::var("CUDA_VISIBLE_DEVICES") {
        Ok(value) => value
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .count(),
        Err(_) => 0,
    }
}

/// Deterministic placement for the handle with instance index `index`.
///
/// - no GPU: CPU with `float32`
/// - one GPU: GPU 0 with `float16`
/// - N GPUs: GPU `index % N` with `float16`
pub fn allocate_device(index: usize, gpu_count: usize) -> DeviceAllocation {
    match gpu_count {
        0 => DeviceAllocation {
            device: Device::Cpu,
            compute_type: ComputeType::Float32,
        },
        1 => DeviceAllocation {
            device: Device::Cuda(0),
            compute_type: ComputeType::Float16,
        },
        n => DeviceAllocation {
            device: Device::Cuda(index % n),
            compute_type: ComputeType::Float16,
        },
    }
}

/// Clamp a requested `max_size` against the visible topology.
///
/// - CPU-only: at most half the machine threads, at least 1; small machines
///   (`cpu_threads <= 4`) are forced to a single instance.
/// - One GPU: forced to 1; contention on a single GPU is worse than
///   serialization.
/// - N GPUs: at most `N * max_instances_per_gpu`.
pub fn normalize_max_size(
    requested: usize,
    gpu_count: usize,
    max_instances_per_gpu: usize,
    cpu_threads: usize,
) -> usize {
    match gpu_count {
        0 => {
            if cpu_threads <= 4 {
                1
            } else {
                requested.min((cpu_threads / 2).max(1))
            }
        }
        1 => 1,
        n => requested.min(n * max_instances_per_gpu),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_device_display() {
        assert_eq!(Device::Cpu.to_string(), "cpu");
        assert_eq!(Device::Cuda(2).to_string(), "cuda:2");
    }

    #[test]
    fn test_cpu_only_allocation() {
        let alloc = allocate_device(3, 0);
        assert_eq!(alloc.device, Device::Cpu);
        assert_eq!(alloc.compute_type, ComputeType::Float32);
    }

    #[test]
    fn test_single_gpu_allocation() {
        for index in 0..4 {
            let alloc = allocate_device(index, 1);
            assert_eq!(alloc.device, Device::Cuda(0));
            assert_eq!(alloc.compute_type, ComputeType::Float16);
        }
    }

    #[test]
    fn test_multi_gpu_round_robin() {
        let devices: Vec<_> = (0..6).map(|i| allocate_device(i, 3).device).collect();
        assert_eq!(
            devices,
            vec![
                Device::Cuda(0),
                Device::Cuda(1),
                Device::Cuda(2),
                Device::Cuda(0),
                Device::Cuda(1),
                Device::Cuda(2),
            ]
        );
    }

    #[rstest]
    #[case(8, 0, 1, 4, 1)] // small CPU machine forced to 1
    #[case(8, 0, 1, 16, 8)] // CPU: half the threads
    #[case(3, 0, 1, 16, 3)] // CPU: requested below the thread cap
    #[case(8, 1, 4, 16, 1)] // single GPU always 1
    #[case(8, 2, 1, 16, 2)] // N GPUs: N * per-gpu
    #[case(8, 2, 3, 16, 6)]
    #[case(2, 4, 2, 16, 2)] // requested below the GPU cap
    fn test_normalize_max_size(
        #[case] requested: usize,
        #[case] gpus: usize,
        #[case] per_gpu: usize,
        #[case] cpu_threads: usize,
        #[case] expected: usize,
    ) {
        assert_eq!(
            normalize_max_size(requested, gpus, per_gpu, cpu_threads),
            expected
        );
    }

    #[test]
    fn test_visible_gpu_count_override() {
        assert_eq!(visible_gpu_count(0), 0);
        assert_eq!(visible_gpu_count(4), 4);
    }
}
