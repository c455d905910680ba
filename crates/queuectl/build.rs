use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let out = Command::new("git").args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

fn main() {
    // Release tarballs have no .git; packagers pass the revision in instead.
    println!("cargo:rerun-if-env-changed=QUEUECTL_BUILD_REV");
    let rev = std::env::var("QUEUECTL_BUILD_REV").ok().or_else(|| {
        let sha = git(&["rev-parse", "--short", "HEAD"])?;
        let dirty = git(&["status", "--porcelain", "--untracked-files=no"])
            .is_some_and(|s| !s.is_empty());
        Some(if dirty { format!("{sha}-dirty") } else { sha })
    });

    println!(
        "cargo:rustc-env=QUEUECTL_GIT_SHA={}",
        rev.as_deref().unwrap_or("unknown")
    );
    println!("cargo:rerun-if-changed=../../.git/HEAD");
}
