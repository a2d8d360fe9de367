//! Generate CRD YAML from Rust types.
//!
//! Usage:
//!   cargo run --bin crdgen                          # to stdout
//!   cargo run --bin crdgen -- --out-dir deploy/crds # one file per CRD

use std::path::PathBuf;

use anyhow::Context;
use application_webhook::crd::application::Application;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let out_dir: Option<PathBuf> = std::env::args()
        .skip_while(|a| a != "--out-dir")
        .nth(1)
        .map(PathBuf::from);

    let crds = vec![(
        "application-crd.yaml",
        serde_yaml::to_string(&Application::crd())?,
    )];

    match out_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            for (name, yaml) in &crds {
                let path = dir.join(name);
                std::fs::write(&path, format!("---\n{yaml}"))
                    .with_context(|| format!("failed to write {}", path.display()))?;
                eprintln!("wrote {}", path.display());
            }
        }
        None => {
            for (_name, yaml) in &crds {
                println!("---\n{yaml}");
            }
        }
    }
    Ok(())
}
