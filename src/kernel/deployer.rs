//! Module package deployment.
//!
//! Two package shapes are accepted: a single unit archive carrying an
//! embedded descriptor, and a distribution archive containing a `libs`
//! directory of units plus surrounding layout. Validation happens against a
//! scratch directory; the target tree is only touched once the package has
//! proven valid and the module is not running. The scratch directory is
//! always released, success or failure.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::kernel::descriptor::{ModuleDescriptor, DESCRIPTOR_RESOURCE};
use crate::kernel::scope;
use crate::properties::Properties;
use crate::types::{Error, Result};

pub struct Deployer {
    target: PathBuf,
    tmp: PathBuf,
}

impl Deployer {
    pub fn new(target: PathBuf, tmp: PathBuf) -> Self {
        Self { target, tmp }
    }

    /// Install a package; returns the deployed module's name.
    ///
    /// `running` is a snapshot of currently running module names; deployment
    /// over a running module is rejected before the target tree is touched.
    pub fn deploy(&self, package: &Path, running: &BTreeSet<String>) -> Result<String> {
        match package.extension().and_then(|e| e.to_str()) {
            Some("jar") => self.deploy_unit(package, running),
            Some("zip") => self.deploy_archive(package, running),
            _ => Err(Error::package_format(format!(
                "unsupported package type: {}",
                package.display()
            ))),
        }
    }

    /// Remove a deployed module's directory tree.
    pub fn undeploy(&self, name: &str, running: &BTreeSet<String>) -> Result<()> {
        if running.contains(name) {
            return Err(Error::module_running(name));
        }
        let module_dir = self.target.join(name);
        if !module_dir.is_dir() {
            return Err(Error::not_found(format!(
                "no filesystem-backed deployment for [{name}]"
            )));
        }
        std::fs::remove_dir_all(&module_dir)?;
        info!(module = name, "undeployed");
        Ok(())
    }

    pub fn module_dir(&self, name: &str) -> PathBuf {
        self.target.join(name)
    }

    fn deploy_unit(&self, unit: &Path, running: &BTreeSet<String>) -> Result<String> {
        let descriptor = read_embedded_descriptor(unit)?.ok_or_else(|| {
            Error::package_format(format!("no descriptor in {}", unit.display()))
        })?;
        if running.contains(&descriptor.name) {
            return Err(Error::module_running(&descriptor.name));
        }

        let libs_dir = self.target.join(&descriptor.name).join("libs");
        std::fs::create_dir_all(&libs_dir)?;
        let file_name = unit
            .file_name()
            .ok_or_else(|| Error::package_format(format!("bad unit path {}", unit.display())))?;
        std::fs::copy(unit, libs_dir.join(file_name))?;
        info!(module = %descriptor.name, unit = %unit.display(), "deployed single unit");
        Ok(descriptor.name)
    }

    fn deploy_archive(&self, archive: &Path, running: &BTreeSet<String>) -> Result<String> {
        std::fs::create_dir_all(&self.tmp)?;
        // Dropping the guard removes the scratch tree on every exit path.
        let scratch = tempfile::TempDir::with_prefix_in("deploy-", &self.tmp)?;
        extract_archive(archive, scratch.path())?;

        let libs_dir = find_libs_dir(scratch.path()).ok_or_else(|| {
            Error::package_format(format!("no libs directory in {}", archive.display()))
        })?;
        let descriptor = scope::scan_units(&libs_dir)?
            .iter()
            .find_map(|unit| read_embedded_descriptor(unit).ok().flatten())
            .ok_or_else(|| {
                Error::package_format(format!(
                    "no unit with a valid descriptor in {}",
                    archive.display()
                ))
            })?;
        if running.contains(&descriptor.name) {
            return Err(Error::module_running(&descriptor.name));
        }

        let source_root = libs_dir
            .parent()
            .ok_or_else(|| Error::internal("libs directory has no parent"))?;
        let module_dir = self.target.join(&descriptor.name);
        if module_dir.exists() {
            debug!(module = %descriptor.name, "replacing existing deployment");
            std::fs::remove_dir_all(&module_dir)?;
        }
        copy_tree(source_root, &module_dir)?;
        info!(module = %descriptor.name, archive = %archive.display(), "deployed archive");
        Ok(descriptor.name)
    }
}

/// Parse the embedded descriptor of a unit archive, `None` when the entry is
/// missing or carries no module name.
pub fn read_embedded_descriptor(unit: &Path) -> Result<Option<ModuleDescriptor>> {
    let file = std::fs::File::open(unit)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut entry = match archive.by_name(DESCRIPTOR_RESOURCE) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut text = String::new();
    entry.read_to_string(&mut text)?;
    Ok(ModuleDescriptor::from_properties(&Properties::parse(&text), false))
}

/// Extract an archive, refusing entries that would escape the destination.
fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(Error::package_format(format!(
                "unsafe entry path in {}",
                archive.display()
            )));
        };
        let out = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = std::fs::File::create(&out)?;
        std::io::copy(&mut entry, &mut writer)?;
    }
    Ok(())
}

/// Locate the `libs` directory in an unpacked tree: directly at the root or
/// one level down (a single wrapping directory).
fn find_libs_dir(root: &Path) -> Option<PathBuf> {
    let direct = root.join("libs");
    if direct.is_dir() {
        return Some(direct);
    }
    let mut children: Vec<PathBuf> = std::fs::read_dir(root)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    children.sort();
    children
        .into_iter()
        .map(|child| child.join("libs"))
        .find(|candidate| candidate.is_dir())
}

fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if from.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}
