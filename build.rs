//! Build script for hush
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! for `hush version`.

fn main() {
    // Embed git commit, build time, and dirty status
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
