use sluice_proto::HMR_SCHEMA_VERSION;

/// The current version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// `sluice <version> (hmr schema <n>)`, plus the git hash when the build provides one.
#[must_use]
pub fn version_string() -> String {
    let mut s = format!("sluice {VERSION} (hmr schema {HMR_SCHEMA_VERSION})");
    if let Some(hash) = option_env!("SLUICE_BUILD_GIT_HASH") {
        s.push_str(&format!(" [{hash}]"));
    }
    s
}
