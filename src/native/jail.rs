//! Private filesystem view for one sandboxed process.
//!
//! The parent plans every path up front; [`JailPlan::enter`] runs in the
//! forked child inside a fresh user and mount namespace. It mounts a small
//! tmpfs as the new root, mirrors the system directories and readable
//! paths into it as read-only binds, binds the working directory writable,
//! seals the tmpfs read-only and pivots into it. Nothing else of the host
//! filesystem stays reachable.

use std::collections::BTreeSet;
use std::ffi::{CStr, CString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use std::ptr;

/// Device nodes bound into every jail.
const DEVICES: [&str; 4] = ["/dev/null", "/dev/zero", "/dev/random", "/dev/urandom"];

/// Mount flags a read-only bind must carry over from the mount it copies.
/// An unprivileged namespace may not clear them.
const CARRIED_FLAGS: [(libc::c_ulong, libc::c_ulong); 4] = [
    (libc::ST_NOEXEC, libc::MS_NOEXEC),
    (libc::ST_NOATIME, libc::MS_NOATIME),
    (libc::ST_NODIRATIME, libc::MS_NODIRATIME),
    (libc::ST_RELATIME, libc::MS_RELATIME),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Access {
    ReadOnly,
    Writable,
    Device,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Step {
    Dir(CString),
    File(CString),
    Link { target: CString, path: CString },
    Bind { source: CString, target: CString, access: Access },
}

#[derive(Clone, Debug)]
pub struct JailPlan {
    root: CString,
    cwd: CString,
    steps: Vec<Step>,
}

impl JailPlan {
    /// Plans a jail rooted at the mount point `root`. `system` paths that
    /// do not exist on this host are skipped; symlinks among them are
    /// recreated as symlinks.
    pub fn new(root: &Path, system: &[PathBuf], readable: &[PathBuf], cwd: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let cwd = std::fs::canonicalize(cwd)?;

        let mut planner = Planner::new(root);
        for path in system {
            planner.mirror(path, Access::ReadOnly, false)?;
        }
        for device in DEVICES {
            planner.mirror(Path::new(device), Access::Device, false)?;
        }
        for path in readable {
            let path = std::fs::canonicalize(path)?;
            if path.starts_with(&cwd) {
                continue;
            }
            planner.mirror(&path, Access::ReadOnly, true)?;
        }
        planner.mirror(&cwd, Access::Writable, true)?;

        Ok(Self {
            root: cstring(root)?,
            cwd: cstring(&cwd)?,
            steps: planner.into_steps()?,
        })
    }

    /// Builds the view and makes it the process root. Called between
    /// `fork` and `exec`, so raw syscalls only.
    pub fn enter(&self) -> io::Result<()> {
        // SAFETY: every pointer comes from a CString owned by `self` or a
        // static C string literal, and outlives the call it is passed to.
        unsafe {
            check(libc::mount(
                ptr::null(),
                c"/".as_ptr(),
                ptr::null(),
                libc::MS_REC | libc::MS_PRIVATE,
                ptr::null(),
            ))?;
            check(libc::mount(
                c"tmpfs".as_ptr(),
                self.root.as_ptr(),
                c"tmpfs".as_ptr(),
                libc::MS_NOSUID | libc::MS_NODEV,
                c"size=1m,mode=0755".as_ptr().cast(),
            ))?;
            for step in &self.steps {
                step.apply()?;
            }
            check(libc::mount(
                ptr::null(),
                self.root.as_ptr(),
                ptr::null(),
                libc::MS_REMOUNT | libc::MS_RDONLY | libc::MS_NOSUID | libc::MS_NODEV,
                ptr::null(),
            ))?;

            check(libc::chdir(self.root.as_ptr()))?;
            if libc::syscall(libc::SYS_pivot_root, c".".as_ptr(), c".".as_ptr()) == 0 {
                check(libc::umount2(c".".as_ptr(), libc::MNT_DETACH))?;
            } else {
                // Initramfs roots cannot be pivoted away from. Without
                // capabilities after exec the program cannot leave a chroot.
                check(libc::chroot(c".".as_ptr()))?;
            }
            check(libc::chdir(c"/".as_ptr()))?;
            check(libc::chdir(self.cwd.as_ptr()))?;
        }
        Ok(())
    }
}

impl Step {
    unsafe fn apply(&self) -> io::Result<()> {
        unsafe {
            match self {
                Step::Dir(path) => ignore_exists(libc::mkdir(path.as_ptr(), 0o755)),
                Step::File(path) => {
                    let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CREAT | libc::O_CLOEXEC, 0o644);
                    check(fd)?;
                    libc::close(fd);
                    Ok(())
                }
                Step::Link { target, path } => ignore_exists(libc::symlink(target.as_ptr(), path.as_ptr())),
                Step::Bind { source, target, access } => {
                    let recursive = if *access == Access::Device { 0 } else { libc::MS_REC };
                    check(libc::mount(
                        source.as_ptr(),
                        target.as_ptr(),
                        ptr::null(),
                        libc::MS_BIND | recursive,
                        ptr::null(),
                    ))?;
                    match access {
                        Access::ReadOnly => remount(target, libc::MS_RDONLY),
                        Access::Writable => remount(target, 0),
                        Access::Device => Ok(()),
                    }
                }
            }
        }
    }
}

/// Re-applies a bind with nosuid and nodev plus `extra`, keeping the flags
/// the source mount locks.
unsafe fn remount(target: &CStr, extra: libc::c_ulong) -> io::Result<()> {
    unsafe {
        let mut stats: libc::statfs64 = std::mem::zeroed();
        check(libc::statfs64(target.as_ptr(), &mut stats))?;
        let current = stats.f_flags as libc::c_ulong;
        let mut flags = libc::MS_REMOUNT | libc::MS_BIND | libc::MS_NOSUID | libc::MS_NODEV | extra;
        for (statfs_flag, mount_flag) in CARRIED_FLAGS {
            if current & statfs_flag != 0 {
                flags |= mount_flag;
            }
        }
        check(libc::mount(ptr::null(), target.as_ptr(), ptr::null(), flags, ptr::null()))
    }
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn ignore_exists(rc: libc::c_int) -> io::Result<()> {
    match check(rc) {
        Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Ok(()),
        other => other,
    }
}

fn cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Collects the directories, files and links to create inside the tmpfs
/// and the binds to place on them.
struct Planner<'a> {
    root: &'a Path,
    dirs: BTreeSet<PathBuf>,
    files: Vec<PathBuf>,
    links: Vec<(PathBuf, PathBuf)>,
    binds: Vec<(PathBuf, Access)>,
}

impl<'a> Planner<'a> {
    fn new(root: &'a Path) -> Self {
        Self {
            root,
            dirs: BTreeSet::new(),
            files: Vec::new(),
            links: Vec::new(),
            binds: Vec::new(),
        }
    }

    /// `required` paths must exist; the rest are skipped when missing.
    fn mirror(&mut self, path: &Path, access: Access, required: bool) -> io::Result<()> {
        if !path.is_absolute() || path.components().any(|c| c == Component::ParentDir) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("jail path must be absolute: {}", path.display()),
            ));
        }
        let metadata = match std::fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound && !required => return Ok(()),
            Err(e) => return Err(e),
        };
        self.parents(path);
        if metadata.file_type().is_symlink() && access == Access::ReadOnly {
            self.links.push((std::fs::read_link(path)?, path.to_path_buf()));
            return Ok(());
        }
        if metadata.is_dir() {
            self.dirs.insert(path.to_path_buf());
        } else {
            self.files.push(path.to_path_buf());
        }
        self.binds.push((path.to_path_buf(), access));
        Ok(())
    }

    fn parents(&mut self, path: &Path) {
        for ancestor in path.ancestors().skip(1) {
            if ancestor.parent().is_some() {
                self.dirs.insert(ancestor.to_path_buf());
            }
        }
    }

    fn inside(&self, path: &Path) -> PathBuf {
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }

    fn into_steps(mut self) -> io::Result<Vec<Step>> {
        // Outer binds first so nested ones land on top of them.
        self.binds.sort_by_key(|(path, _)| path.components().count());

        let mut steps = Vec::new();
        for dir in &self.dirs {
            steps.push(Step::Dir(cstring(&self.inside(dir))?));
        }
        for (target, path) in &self.links {
            steps.push(Step::Link {
                target: cstring(target)?,
                path: cstring(&self.inside(path))?,
            });
        }
        for file in &self.files {
            steps.push(Step::File(cstring(&self.inside(file))?));
        }
        for (path, access) in &self.binds {
            steps.push(Step::Bind {
                source: cstring(path)?,
                target: cstring(&self.inside(path))?,
                access: *access,
            });
        }
        Ok(steps)
    }
}
