//! Scratch directories for one sandboxed run.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use rand::{distributions::Alphanumeric, Rng};

use crate::proto::FileRef;
use crate::store::{Digest, FileStore};
use crate::util::ident::is_safe_identifier;

/// Scratch space for one run: `in/` holds hard-linked input blobs and is
/// exposed read-only to the sandboxed program, `out/` collects whatever it
/// leaves behind. The whole tree is removed on drop, best-effort.
pub struct RunDir {
    root: PathBuf,
    input_dir: PathBuf,
    output_dir: PathBuf,
}

impl RunDir {
    pub fn create() -> io::Result<RunDir> {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        let root = std::env::temp_dir().join(format!("gavel_run_{}", suffix));
        let input_dir = root.join("in");
        let output_dir = root.join("out");
        fs::create_dir_all(&input_dir)?;
        fs::create_dir(&output_dir)?;
        Ok(RunDir {
            root,
            input_dir,
            output_dir,
        })
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Hard-link every input blob under its logical name. A missing blob at
    /// this point is an invariant violation: existence was checked at the
    /// service boundary.
    pub fn link_inputs(&self, store: &FileStore, inputs: &[FileRef]) -> Result<()> {
        for input in inputs {
            self.link_into_input(store, &input.digest, &input.name)?;
        }
        Ok(())
    }

    /// Hard-link one blob into `in/` under `name`, returning the linked path.
    pub fn link_into_input(
        &self,
        store: &FileStore,
        digest: &Digest,
        name: &str,
    ) -> Result<PathBuf> {
        let from = store.path_for(digest);
        let to = self.input_dir.join(name);
        fs::hard_link(&from, &to)
            .with_context(|| format!("hard-linking input {} ({})", name, digest))?;
        Ok(to)
    }

    /// Open the scratch dirs up to the unprivileged sandbox account.
    pub fn make_world_accessible(&self) -> io::Result<()> {
        for dir in [&self.root, &self.input_dir, &self.output_dir] {
            set_mode(dir, 0o777)?;
        }
        Ok(())
    }

    /// Store every regular file from `out/` whose name is a safe identifier.
    /// Unsafe names are skipped, not errors.
    pub fn collect_outputs(&self, store: &FileStore) -> Result<Vec<FileRef>> {
        let mut outputs = Vec::new();
        for entry in fs::read_dir(&self.output_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(name) => {
                    tracing::debug!("skipping output file with non-UTF-8 name {:?}", name);
                    continue;
                }
            };
            if !is_safe_identifier(&name) {
                tracing::debug!("skipping output file with unsafe name {:?}", name);
                continue;
            }
            let path = entry.path();
            // The sandboxed program may have left the file with tight
            // permissions under another uid; it belongs to the store now.
            set_mode(&path, 0o666)?;
            let digest = store.save(&fs::read(&path)?)?;
            outputs.push(FileRef { name, digest });
        }
        Ok(outputs)
    }
}

impl Drop for RunDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.root) {
            log::error!("{:?}: {}", self.root, e);
        }
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
