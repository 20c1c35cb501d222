use std::path::PathBuf;

const ENV_CANDIDATES: [&str; 4] = ["REST_EXT_DIR", "LD_LIBRARY_PATH", "DYLD_LIBRARY_PATH", "PATH"];

/// Split `/path/to/lib1:/path/to/lib2` into individual paths.
fn split_search_paths(paths: &str) -> impl Iterator<Item = String> + '_ {
    let split_char = if cfg!(windows) { ';' } else { ':' };
    paths.split(split_char).filter(|path| !path.is_empty()).map(str::to_string)
}

/// Directories that may hold `libopenblas`, taken from the environment and the usual prefixes.
///
/// Layout of lib subdirectories follows https://github.com/coreylowman/cudarc/blob/main/build.rs
#[allow(dead_code)]
fn openblas_search_dirs() -> Vec<PathBuf> {
    let prefixes = ["/usr", "/usr/local", "/opt"];
    let subdirs = ["", "lib", "lib64", "lib/x86_64-linux-gnu"];

    let roots = ENV_CANDIDATES
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .flat_map(|paths| split_search_paths(&paths).collect::<Vec<_>>())
        .chain(prefixes.iter().map(|p| p.to_string()))
        .map(PathBuf::from);

    let mut dirs: Vec<PathBuf> = roots
        .flat_map(|root| subdirs.iter().map(move |sub| root.join(sub)).collect::<Vec<_>>())
        .filter(|path| path.is_dir())
        .filter_map(|path| std::fs::canonicalize(path).ok())
        .collect();
    dirs.dedup();
    dirs
}

#[allow(dead_code)]
fn link_openblas() {
    for name in ENV_CANDIDATES {
        println!("cargo:rerun-if-env-changed={name}");
    }
    for path in openblas_search_dirs() {
        println!("cargo:rustc-link-search=native={}", path.display());
    }
    println!("cargo:rustc-link-lib=openblas");
    println!("cargo:rustc-link-lib=gomp");
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    #[cfg(feature = "use_openblas")]
    link_openblas();
}
