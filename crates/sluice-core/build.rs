// Embed the short git hash in version output when building from a checkout.

use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=../../.git/HEAD");
    println!("cargo:rerun-if-env-changed=SLUICE_BUILD_GIT_HASH");

    if std::env::var_os("SLUICE_BUILD_GIT_HASH").is_some() {
        return;
    }
    let hash = Command::new("git")
        .args(["rev-parse", "--short=12", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok());
    if let Some(hash) = hash.map(|h| h.trim().to_string()).filter(|h| !h.is_empty()) {
        println!("cargo:rustc-env=SLUICE_BUILD_GIT_HASH={hash}");
    }
}
