//! Installed-package inventory.
//!
//! Packages deployed under the site's deploy root leave a JSON manifest in
//! `<deploy_root>/manifests/`. This crate reads those manifests back into
//! [`PackageDistribution`] records, enriched with the live git state of the
//! source checkout when one exists, and drives checkout/pull/upgrade for
//! editable packages.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use git2::Repository;
use ops_proto::PackageDistribution;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// On-disk manifest written by the installer at deploy time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageManifest {
    pub name: String,
    pub version: String,
    /// Source checkout the package was installed from, if any.
    pub path: Option<PathBuf>,
    /// Installed in editable/dev mode.
    #[serde(default)]
    pub editable: bool,
    pub installed_at: DateTime<Utc>,
}

pub fn manifest_dir(deploy_root: &Path) -> PathBuf {
    deploy_root.join("manifests")
}

/// Look up one installed package by name. `None` when no manifest exists or
/// the manifest is unreadable.
pub fn get_package(deploy_root: &Path, name: &str) -> Option<PackageDistribution> {
    let path = manifest_dir(deploy_root).join(format!("{name}.json"));
    let data = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str::<PackageManifest>(&data) {
        Ok(manifest) => Some(distribution_from(manifest)),
        Err(e) => {
            warn!(manifest = %path.display(), "skipping unreadable manifest: {e}");
            None
        }
    }
}

/// All installed packages whose name contains `filter`, sorted by name.
pub fn list_packages(deploy_root: &Path, filter: &str) -> Vec<PackageDistribution> {
    let dir = manifest_dir(deploy_root);
    let Ok(entries) = std::fs::read_dir(&dir) else {
        debug!(dir = %dir.display(), "no manifest directory");
        return Vec::new();
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut packages = Vec::new();
    for path in paths {
        let Ok(data) = std::fs::read_to_string(&path) else {
            continue;
        };
        match serde_json::from_str::<PackageManifest>(&data) {
            Ok(manifest) if manifest.name.contains(filter) => {
                packages.push(distribution_from(manifest));
            }
            Ok(_) => {}
            Err(e) => warn!(manifest = %path.display(), "skipping unreadable manifest: {e}"),
        }
    }
    packages
}

fn distribution_from(manifest: PackageManifest) -> PackageDistribution {
    let branch = manifest.path.as_deref().and_then(current_branch);
    PackageDistribution {
        name: manifest.name,
        version: manifest.version,
        path: manifest.path,
        branch,
        editable: manifest.editable,
    }
}

/// Active branch of the checkout at `path`. `None` for detached heads,
/// non-repositories, and unborn branches.
pub fn current_branch(path: &Path) -> Option<String> {
    let repo = Repository::open(path).ok()?;
    let head = repo.head().ok()?;
    if head.is_branch() {
        head.shorthand().map(str::to_string)
    } else {
        None
    }
}

/// Check out `reference` (branch, tag, or commit) in the package's source
/// checkout. Returns `false` when the package has no tracked checkout or
/// the checkout fails; failures are logged, not raised.
pub fn switch_reference(package: &PackageDistribution, reference: &str) -> bool {
    let Some(path) = &package.path else {
        return false;
    };
    if package.branch.is_none() {
        return false;
    }

    match checkout(path, reference) {
        Ok(()) => true,
        Err(e) => {
            warn!(package = %package.name, reference, "could not checkout: {e:#}");
            false
        }
    }
}

fn checkout(path: &Path, reference: &str) -> Result<()> {
    let repo = Repository::open(path).context("open repository")?;
    let (object, refname) = repo
        .revparse_ext(reference)
        .with_context(|| format!("resolve '{reference}'"))?;

    repo.checkout_tree(&object, None).context("checkout tree")?;
    match refname {
        Some(r) => repo.set_head(r.name().context("reference has no name")?)?,
        None => repo.set_head_detached(object.id())?,
    }
    Ok(())
}

/// Pull the package's branch from origin and reinstall it with the
/// configured installer. Returns `false` for packages without a tracked
/// checkout and on any step failing.
pub fn pull(package: &PackageDistribution, installer: &str) -> bool {
    let (Some(path), Some(branch)) = (&package.path, &package.branch) else {
        return false;
    };
    let path = path.to_string_lossy();

    if !run_command("git", &["-C", &path, "pull", "origin", branch]) {
        warn!(package = %package.name, branch, "could not pull");
        return false;
    }

    install_package(installer, &path, package.editable)
}

/// Install or upgrade a package from a name or source path. Errors are
/// logged and folded into the boolean result.
pub fn install_package(installer: &str, source: &str, editable: bool) -> bool {
    let mut args = vec!["install", "-U"];
    if editable {
        args.push("-e");
    }
    args.push(source);

    run_command(installer, &args)
}

fn run_command(program: &str, args: &[&str]) -> bool {
    debug!(program, ?args, "running");
    match Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(exit) => exit.success(),
        Err(e) => {
            warn!(program, "could not run: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(deploy_root: &Path, manifest: &PackageManifest) {
        let dir = manifest_dir(deploy_root);
        std::fs::create_dir_all(&dir).expect("mkdir");
        let data = serde_json::to_string_pretty(manifest).expect("serialize");
        std::fs::write(dir.join(format!("{}.json", manifest.name)), data).expect("write");
    }

    fn manifest(name: &str, path: Option<&Path>, editable: bool) -> PackageManifest {
        PackageManifest {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            path: path.map(Path::to_path_buf),
            editable,
            installed_at: Utc::now(),
        }
    }

    fn init_repo(path: &Path) -> Repository {
        let repo = Repository::init(path).expect("init");
        {
            let sig = git2::Signature::now("test", "test@example.com").expect("sig");
            let tree_id = {
                let mut index = repo.index().expect("index");
                index.write_tree().expect("tree")
            };
            let tree = repo.find_tree(tree_id).expect("find tree");
            repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
                .expect("commit");
        }
        repo
    }

    #[test]
    fn test_get_package_missing_manifest() {
        let root = tempfile::tempdir().expect("tempdir");
        assert!(get_package(root.path(), "ghost").is_none());
    }

    #[test]
    fn test_get_package_without_checkout() {
        let root = tempfile::tempdir().expect("tempdir");
        write_manifest(root.path(), &manifest("ops-core", None, false));

        let pkg = get_package(root.path(), "ops-core").expect("package");
        assert_eq!(pkg.version, "1.0.0");
        assert!(pkg.path.is_none());
        assert!(pkg.branch.is_none());
        assert!(!pkg.editable);
    }

    #[test]
    fn test_branch_none_for_non_repository_path() {
        let root = tempfile::tempdir().expect("tempdir");
        let src = tempfile::tempdir().expect("tempdir");
        write_manifest(root.path(), &manifest("ops-core", Some(src.path()), true));

        let pkg = get_package(root.path(), "ops-core").expect("package");
        assert!(pkg.editable);
        assert!(pkg.branch.is_none());
    }

    #[test]
    fn test_branch_resolved_from_checkout() {
        let root = tempfile::tempdir().expect("tempdir");
        let src = tempfile::tempdir().expect("tempdir");
        init_repo(src.path());
        write_manifest(root.path(), &manifest("ops-core", Some(src.path()), true));

        let pkg = get_package(root.path(), "ops-core").expect("package");
        assert!(pkg.branch.is_some());
    }

    #[test]
    fn test_list_packages_filter_and_order() {
        let root = tempfile::tempdir().expect("tempdir");
        write_manifest(root.path(), &manifest("ops-depui", None, false));
        write_manifest(root.path(), &manifest("ops-core", None, false));
        write_manifest(root.path(), &manifest("other-tool", None, false));

        let all = list_packages(root.path(), "ops-");
        let names: Vec<&str> = all.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["ops-core", "ops-depui"]);

        assert_eq!(list_packages(root.path(), "").len(), 3);
    }

    #[test]
    fn test_list_packages_without_manifest_dir() {
        let root = tempfile::tempdir().expect("tempdir");
        assert!(list_packages(root.path(), "").is_empty());
    }

    #[test]
    fn test_switch_reference_requires_tracked_checkout() {
        let pkg = PackageDistribution {
            name: "ops-core".to_string(),
            version: "1.0.0".to_string(),
            path: None,
            branch: None,
            editable: false,
        };
        assert!(!switch_reference(&pkg, "develop"));
    }

    #[test]
    fn test_switch_reference_to_branch() {
        let src = tempfile::tempdir().expect("tempdir");
        let repo = init_repo(src.path());
        {
            let head = repo.head().expect("head").peel_to_commit().expect("commit");
            repo.branch("develop", &head, false).expect("branch");
        }

        let pkg = PackageDistribution {
            name: "ops-core".to_string(),
            version: "1.0.0".to_string(),
            path: Some(src.path().to_path_buf()),
            branch: current_branch(src.path()),
            editable: true,
        };

        assert!(switch_reference(&pkg, "develop"));
        assert_eq!(current_branch(src.path()).as_deref(), Some("develop"));
    }

    #[test]
    fn test_switch_reference_unknown_ref_is_false() {
        let src = tempfile::tempdir().expect("tempdir");
        init_repo(src.path());

        let pkg = PackageDistribution {
            name: "ops-core".to_string(),
            version: "1.0.0".to_string(),
            path: Some(src.path().to_path_buf()),
            branch: current_branch(src.path()),
            editable: true,
        };

        assert!(!switch_reference(&pkg, "no-such-branch"));
    }

    #[test]
    fn test_pull_requires_tracked_checkout() {
        let pkg = PackageDistribution {
            name: "ops-core".to_string(),
            version: "1.0.0".to_string(),
            path: None,
            branch: None,
            editable: false,
        };
        assert!(!pull(&pkg, "pip"));
    }

    #[test]
    fn test_install_package_missing_installer_is_false() {
        assert!(!install_package("definitely-not-an-installer", "ops-core", false));
    }
}
