mod raw {
    // The full list of constants is documented at https://docs.rs/built/latest/built/index.html
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// Crate version such as 0.1.0
pub const G1_REFINE_PKG_VERSION: &str = raw::PKG_VERSION;

/// Comma separated features enabled for this build
pub const G1_REFINE_FEATURES: &str = raw::FEATURES_STR;

lazy_static! {
    /// Git version such as a96e8f991c91a81df51e7975849441f52fdbcdcc, or a96e8f991c91a81df51e7975849441f52fdbcdcc-dirty,
    /// or unknown-git-version if the crate is not built from a git repo.
    pub static ref G1_REFINE_GIT_VERSION: &'static str = &G1_REFINE_GIT_VERSION_STRING;

    // Owned string
    static ref G1_REFINE_GIT_VERSION_STRING: String = match raw::GIT_COMMIT_HASH {
        Some(hash) => format!("{}{}", hash, if raw::GIT_DIRTY.unwrap_or(false) { "-dirty" } else { "" }),
        None => "unknown-git-version".to_string(),
    };
}

/// A one-line description of this build, logged at initialization.
pub fn banner() -> String {
    format!(
        "g1-refine {} ({}), features: [{}]",
        G1_REFINE_PKG_VERSION, *G1_REFINE_GIT_VERSION, G1_REFINE_FEATURES
    )
}
