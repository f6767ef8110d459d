//! Backend binary acquisition

mod platform;
mod provisioner;

pub use platform::{current_target, executable_name, platform_target};
pub use provisioner::{resolve_binary, select_release, BinaryProvisioner, Release, ReleaseAsset};
