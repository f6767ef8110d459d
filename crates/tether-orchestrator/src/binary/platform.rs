//! Platform target detection

use tether_core::error::ProvisionError;

/// Release target triple for an OS / architecture pair
pub fn platform_target(os: &str, arch: &str) -> Result<&'static str, ProvisionError> {
    let target = match (os, arch) {
        ("macos", "aarch64") => "aarch64-apple-darwin",
        ("macos", "x86_64") => "x86_64-apple-darwin",
        ("linux", "x86_64") => "x86_64-unknown-linux-gnu",
        ("linux", "aarch64") => "aarch64-unknown-linux-gnu",
        ("windows", "x86_64") => "x86_64-pc-windows-msvc",
        _ => {
            return Err(ProvisionError::UnsupportedPlatform {
                os: os.to_string(),
                arch: arch.to_string(),
            })
        }
    };
    Ok(target)
}

/// Release target for the running host
pub fn current_target() -> Result<&'static str, ProvisionError> {
    platform_target(std::env::consts::OS, std::env::consts::ARCH)
}

/// Append the platform's executable extension
pub fn executable_name(base: &str) -> String {
    format!("{}{}", base, std::env::consts::EXE_SUFFIX)
}
