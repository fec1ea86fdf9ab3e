//! Resolve a blob reference into files on disk.
//!
//! Opaque blobs are written verbatim to the target path. Directories are created under
//! the target and their entries fetched into them. The members of a static-set are fetched
//! concurrently into the same target, [NUM_WORKERS] at a time. Files are written under
//! the target by their manifest name.
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::SystemTime;

use filetime::FileTime;
use log::{debug, error};

use crate::blobref::BlobRef;
use crate::download::file_reader;
use crate::error::{Error, Result};
use crate::schema::{Blob, SNIFF_SIZE};
use crate::store::Fetcher;

/// Concurrent member fetches per static-set.
pub const NUM_WORKERS: usize = 10;

/// Fetch the thing `br` points to into `targ`, not just the blob.
pub fn smart_fetch(src: &dyn Fetcher, targ: &Path, br: &BlobRef) -> Result<()> {
    debug!("fetching {}", br);
    let mut rc = src.fetch(br)?;
    let mut prefix = vec![];
    (&mut rc).take(SNIFF_SIZE).read_to_end(&mut prefix)?;

    match Blob::sniff(&prefix)? {
        Blob::Opaque => {
            debug!("fetching opaque data {} into {:?}", br, targ);
            let mut f = File::create(targ)?;
            f.write_all(&prefix)?;
            io::copy(&mut rc, &mut f)?;
            Ok(())
        },
        Blob::Directory(dir) => {
            let dp = target_name(targ, &dir.file_name)?;
            debug!("fetching directory {} into {:?}", br, dp);
            create_dir(&dp, dir.mode())?;
            if let Err(e) = set_file_meta(&dp, dir.mode(), dir.mtime()) {
                error!("cannot set metadata on {:?}: {}", dp, e);
            }
            smart_fetch(src, &dp, &dir.entries)
        },
        Blob::StaticSet(members) => {
            debug!("fetching directory entries {} into {:?}", br, targ);
            fetch_members(src, targ, &members)
        },
        Blob::File(fs) => {
            let mut content = file_reader(src, &fs)?;
            let name = target_name(targ, &fs.file_name)?;
            if let Ok(meta) = fs::metadata(&name) {
                if meta.is_file() && meta.len() == fs.size() {
                    debug!("skipping {:?}; already exists", name);
                    return Ok(());
                }
            }
            debug!("writing {} to {:?}", br, name);
            let mut f = File::create(&name)?;
            io::copy(&mut content, &mut f)?;
            drop(f);
            if let Err(e) = set_file_meta(&name, fs.mode(), fs.mtime()) {
                error!("cannot set metadata on {:?}: {}", name, e);
            }
            Ok(())
        },
    }
}

/// Fetch every member into `targ` and report the first failure in member order.
///
/// All members are attempted; a failure does not stop its siblings.
fn fetch_members(src: &dyn Fetcher, targ: &Path, members: &[BlobRef]) -> Result<()> {
    if members.is_empty() {
        return Ok(());
    }
    let next = AtomicUsize::new(0);
    let (res_tx, res_rx) = mpsc::channel::<(usize, Result<()>)>();
    thread::scope(|s| {
        for _ in 0..NUM_WORKERS.min(members.len()) {
            let res_tx = res_tx.clone();
            let next = &next;
            s.spawn(move || loop {
                let i = next.fetch_add(1, Ordering::SeqCst);
                if i >= members.len() {
                    break;
                }
                let r = smart_fetch(src, targ, &members[i]);
                if res_tx.send((i, r)).is_err() {
                    break;
                }
            });
        }
    });
    drop(res_tx);

    let mut results: Vec<Option<Result<()>>> = members.iter().map(|_| None).collect();
    for (i, r) in res_rx {
        results[i] = Some(r);
    }
    for (i, r) in results.into_iter().enumerate() {
        match r {
            Some(Ok(())) => {},
            Some(Err(e)) => return Err(e),
            None => {
                return Err(Error::UpstreamUnavailable(format!("no result for member {}", members[i])));
            },
        }
    }
    Ok(())
}

fn target_name(targ: &Path, file_name: &str) -> Result<PathBuf> {
    match Path::new(file_name).file_name() {
        Some(v) => Ok(targ.join(v)),
        None => Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unusable file name {:?}", file_name),
        ))),
    }
}

#[cfg(unix)]
fn create_dir(dir: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(mode).create(dir)
}

#[cfg(not(unix))]
fn create_dir(dir: &Path, _mode: u32) -> io::Result<()> {
    fs::create_dir_all(dir)
}

/// Apply mode and modification time; the first failure is returned after both are tried.
fn set_file_meta(name: &Path, mode: u32, mtime: Option<SystemTime>) -> io::Result<()> {
    let err_mode = set_mode(name, mode).err();
    let err_time = match mtime {
        Some(t) => {
            let ft = FileTime::from_system_time(t);
            filetime::set_file_times(name, ft, ft).err()
        },
        None => None,
    };
    match err_mode.or(err_time) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(unix)]
fn set_mode(name: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(name, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_name: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
