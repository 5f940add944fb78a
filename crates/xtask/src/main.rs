use std::{
    env, fs,
    path::PathBuf,
    process::{Command, exit},
};

/// (package, binary) pairs copied into the plugin directory.
const PLUGINS: &[(&str, &str)] = &[
    ("plugin_echo", "plugin_echo"),
    ("plugin_math", "plugin_add"),
    ("plugin_math", "plugin_mul"),
];

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();

    // cargo run -p xtask -- plugin_add
    let selected: Vec<(&str, &str)> = if args.is_empty() {
        PLUGINS.to_vec()
    } else {
        args.iter()
            .map(|wanted| {
                PLUGINS
                    .iter()
                    .copied()
                    .find(|(_, bin)| bin == wanted)
                    .unwrap_or_else(|| {
                        eprintln!("Unknown plugin `{wanted}`");
                        exit(1);
                    })
            })
            .collect()
    };

    let out_dir = env::var_os("ROUTER_PLUGINS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("plugins"));
    if let Err(e) = fs::create_dir_all(&out_dir) {
        eprintln!("Failed to create {}: {e}", out_dir.display());
        exit(1);
    }

    for (pkg, bin) in selected {
        println!("Building `{bin}` from `{pkg}`…");

        let status = Command::new("cargo")
            .args(["build", "--release", "--package", pkg, "--bin", bin])
            .status()
            .unwrap_or_else(|e| {
                eprintln!("Failed to launch cargo for `{bin}`: {e}");
                exit(1);
            });
        if !status.success() {
            eprintln!("Cargo build failed for `{bin}`.");
            exit(1);
        }

        let file_name = format!("{bin}{}", env::consts::EXE_SUFFIX);
        let built = PathBuf::from("target").join("release").join(&file_name);
        let dest = out_dir.join(&file_name);

        // copying over a running plugin is picked up by the router's watcher
        if let Err(e) = fs::copy(&built, &dest) {
            eprintln!("Failed to copy `{}` → `{}`: {e}", built.display(), dest.display());
            exit(1);
        }
        println!("Copied {} → {}", built.display(), dest.display());
    }
}
