//! Test doubles for the kernel and the eBPF steering programs.

pub mod fake_kernel;
pub mod fake_steering;

pub use fake_kernel::{FakeKernel, SentArp};
pub use fake_steering::{FakeSteeringLoader, FakeSteeringState};
