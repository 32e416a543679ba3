use std::process::Command;

fn main() {
    // Embed the short commit id so a running gateway can tell which code
    // it serves.
    let head = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .unwrap_or_else(|| std::env::var("GIT_HEAD").unwrap_or_else(|_| "unknown".into()));

    println!("cargo:rustc-env=GIT_HEAD={}", head.trim());
    println!("cargo:rerun-if-env-changed=GIT_HEAD");
}
