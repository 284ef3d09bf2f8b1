//! Platform fingerprint helpers used for cloud metadata.

/// CPU architecture, e.g. `x86_64` or `aarch64`.
pub fn machine() -> &'static str {
    std::env::consts::ARCH
}

/// Operating system, e.g. `linux`.
pub fn system() -> &'static str {
    std::env::consts::OS
}

/// Agent version, baked in at compile time.
pub fn agent_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
