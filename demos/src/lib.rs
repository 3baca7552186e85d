//! CNNMRF demos
//!
//! Everything around the style-transfer model that a runnable program needs:
//! backend selection, image I/O with ImageNet normalization, and the
//! multi-resolution synthesis driver.
//!
//! ## Usage
//!
//! ```bash
//! # Random backbone weights, useful for smoke tests only
//! cargo run --release --bin synthesize -- style.jpg content.jpg
//!
//! # Torchvision VGG19 weights on the GPU
//! cargo run --release --features wgpu,pretrained --bin synthesize -- \
//!     style.jpg content.jpg --weights vgg19-dcbb9e9d.pth
//! ```

pub mod backend;
pub mod config;
pub mod imaging;
pub mod synthesis;

pub use backend::{create_device, SelectedBackend, SelectedDevice, BACKEND_NAME};
pub use config::SynthesisConfig;
pub use synthesis::{pyramid, synthesize, SynthesisImage};
