use std::sync::LazyLock;

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format_version(
        env!("CARGO_PKG_VERSION"),
        option_env!("VERGEN_GIT_SHA"),
        option_env!("VERGEN_GIT_DIRTY") == Some("true"),
    )
});

fn format_version(package: &str, sha: Option<&str>, dirty: bool) -> String {
    format!(
        "{}-{}{}",
        package,
        sha.map(|sha| &sha[..sha.len().min(12)]).unwrap_or("unknown"),
        if dirty { "-dirty" } else { "" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn shortens_sha_and_marks_dirty_trees() {
        assert_eq!(
            format_version("0.1.0", Some("0123456789abcdef0123"), true),
            "0.1.0-0123456789ab-dirty"
        );
        assert_eq!(format_version("0.1.0", None, false), "0.1.0-unknown");
    }
}
