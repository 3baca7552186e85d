//! Compile-time backend selection.
//!
//! `cuda` wins over `wgpu`, which wins over the default `ndarray` backend.
//! Synthesis runs on the autodiff wrapper of the selected backend, since the
//! image itself is the optimized parameter.

use burn::backend::Autodiff;
use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(feature = "cuda")] {
        use burn::backend::cuda::{Cuda, CudaDevice};

        /// Backend the tensors live on.
        pub type InnerBackend = Cuda;
        /// Device of [`InnerBackend`].
        pub type SelectedDevice = CudaDevice;

        /// Human readable backend name for logs.
        pub const BACKEND_NAME: &str = "CUDA (NVIDIA GPU)";
    } else if #[cfg(feature = "wgpu")] {
        use burn::backend::wgpu::{Wgpu, WgpuDevice};

        /// Backend the tensors live on.
        pub type InnerBackend = Wgpu;
        /// Device of [`InnerBackend`].
        pub type SelectedDevice = WgpuDevice;

        /// Human readable backend name for logs.
        pub const BACKEND_NAME: &str = "WGPU (GPU)";
    } else {
        use burn::backend::ndarray::{NdArray, NdArrayDevice};

        /// Backend the tensors live on.
        pub type InnerBackend = NdArray;
        /// Device of [`InnerBackend`].
        pub type SelectedDevice = NdArrayDevice;

        /// Human readable backend name for logs.
        pub const BACKEND_NAME: &str = "NdArray (CPU)";
    }
}

/// Backend the synthesis image is optimized on.
pub type SelectedBackend = Autodiff<InnerBackend>;

/// The default device of the selected backend.
pub fn create_device() -> SelectedDevice {
    SelectedDevice::default()
}
