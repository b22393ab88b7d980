pub mod sandbox;

/// `scrubbox 0.1.0 (x86_64-linux-gnu, static, release)`
pub fn version(name: &str) -> String {
    let env = if cfg!(target_env = "musl") {
        "musl"
    } else if cfg!(target_env = "gnu") {
        "gnu"
    } else {
        "unknown"
    };
    let linkage = if cfg!(target_feature = "crt-static") { "static" } else { "dynamic" };
    let profile = if cfg!(debug_assertions) { "debug" } else { "release" };

    format!(
        "{name} {} ({}-{}-{env}, {linkage}, {profile})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::ARCH,
        std::env::consts::OS,
    )
}
