//! Keep a second copy of every single-file upload under a backup root.
//!
//! The copy of content `sha224-abcdef...` lives at `<root>/abc/def/sha224-abcdef....dat`.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{error, info};

/// Backup location for the content reference text `content_ref` under `root`.
pub fn paranoid_path(root: &Path, content_ref: &str) -> Option<PathBuf> {
    let (_, hsh) = content_ref.split_once('-')?;
    if hsh.len() < 6 || !hsh.is_char_boundary(3) || !hsh.is_char_boundary(6) {
        return None;
    }
    Some(root.join(&hsh[..3]).join(&hsh[3..6]).join(format!("{}.dat", content_ref)))
}

/// Hard link `src` to `dst`, copying when linking is not possible.
pub fn link_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    if fs::hard_link(src, dst).is_ok() {
        return Ok(());
    }
    fs::copy(src, dst).map(|_| ())
}

/// Archives `source` to `dest` when dropped. Failures are only logged.
#[derive(Debug)]
pub struct ParanoidCopy {
    source: PathBuf,
    dest: PathBuf,
}

impl ParanoidCopy {
    pub fn new(source: &Path, dest: PathBuf) -> ParanoidCopy {
        ParanoidCopy {
            source: source.to_path_buf(),
            dest,
        }
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    fn run(&self) -> io::Result<()> {
        if let Some(parent) = self.dest.parent() {
            create_private_dir(parent)?;
        }
        link_or_copy(&self.source, &self.dest)
    }
}

impl Drop for ParanoidCopy {
    fn drop(&mut self) {
        info!("paranoid copying {:?} to {:?}", self.source, self.dest);
        if let Err(e) = self.run() {
            error!("error copying {:?} to {:?}: {}", self.source, self.dest, e);
        }
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}
