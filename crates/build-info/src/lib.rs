//! Build metadata baked in by `build.rs`, shared by every conductor binary.

use once_cell::sync::Lazy;

static BUILD_ID: Lazy<String> = Lazy::new(|| {
    option_env!("CONDUCTOR_BUILD_ID")
        .unwrap_or("unknown build")
        .to_string()
});

/// Full build identifier, e.g. `"3f2a9c1d0b7e | 2026-10-05 15:47:12 UTC"`.
pub fn build_id() -> &'static str {
    BUILD_ID.as_str()
}

/// One-line banner logged by binaries at startup.
pub fn banner(binary: &str, version: &str) -> String {
    format!("{} {} ({})", binary, version, build_id())
}
