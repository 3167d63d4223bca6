//! Setup performed in the forked child between `fork` and `exec`.
//!
//! Everything reachable from [`ChildLimits::apply`] must be
//! async-signal-safe: raw syscalls only, no allocation, no locks.

use std::ffi::CStr;
use std::io;

use serde::{Deserialize, Serialize};

use crate::config::SandboxConfig;
use crate::core::{domain::ResourceProfile, traits::sandbox::SandboxCommand};
use crate::native::jail::JailPlan;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkIsolation {
    Off,
    /// Run in an empty network namespace; refuse to run when the kernel
    /// cannot create one.
    #[default]
    Required,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilesystemIsolation {
    Off,
    /// Run inside a private root holding only the system paths, the
    /// readable paths and the writable working directory; refuse to run
    /// when it cannot be built.
    #[default]
    Jail,
}

/// Id the sandboxed process sees when the judge itself runs as root, so
/// `exec` drops the namespace capabilities.
const OVERFLOW_ID: u32 = 65534;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type Resource = libc::c_int;

#[derive(Clone, Debug)]
pub struct ChildLimits {
    cpu_seconds: u64,
    address_space_bytes: Option<u64>,
    file_size_bytes: u64,
    open_files: u64,
    processes: Option<u64>,
    namespaces: libc::c_int,
    uid_map: Vec<u8>,
    gid_map: Vec<u8>,
    jail: Option<JailPlan>,
}

impl ChildLimits {
    pub fn new(limits: &ResourceProfile, config: &SandboxConfig, command: &SandboxCommand) -> io::Result<Self> {
        let mut namespaces = 0;
        if config.network == NetworkIsolation::Required {
            namespaces |= libc::CLONE_NEWUSER | libc::CLONE_NEWNET;
        }
        let jail = match config.filesystem {
            FilesystemIsolation::Jail => {
                namespaces |= libc::CLONE_NEWUSER | libc::CLONE_NEWNS;
                Some(JailPlan::new(
                    &config.jail_root,
                    &config.system_paths,
                    &command.readable,
                    &command.cwd,
                )?)
            }
            FilesystemIsolation::Off => None,
        };

        // Formatted here because the child must not allocate.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Ok(Self {
            cpu_seconds: limits.cpu_time_ms.div_ceil(1000).max(1),
            address_space_bytes: command.address_space_limit.then(|| {
                limits
                    .memory_limit_bytes
                    .saturating_mul(config.address_space_factor)
            }),
            file_size_bytes: config.max_file_size_bytes,
            open_files: config.max_open_files,
            processes: config.max_processes,
            namespaces,
            uid_map: id_map(uid),
            gid_map: id_map(gid),
            jail,
        })
    }

    pub fn cpu_seconds(&self) -> u64 {
        self.cpu_seconds
    }

    pub fn address_space_bytes(&self) -> Option<u64> {
        self.address_space_bytes
    }

    pub fn apply(&self) -> io::Result<()> {
        if self.namespaces != 0 {
            self.unshare()?;
        }
        if let Some(jail) = &self.jail {
            jail.enter()?;
        }

        set_limit(libc::RLIMIT_CORE, 0, 0)?;
        // The hard limit sits one second above the soft one so the process
        // gets SIGXCPU first and SIGKILL only if it ignores it.
        set_limit(libc::RLIMIT_CPU, self.cpu_seconds, self.cpu_seconds + 1)?;
        set_limit(libc::RLIMIT_FSIZE, self.file_size_bytes, self.file_size_bytes)?;
        set_limit(libc::RLIMIT_NOFILE, self.open_files, self.open_files)?;
        if let Some(bytes) = self.address_space_bytes {
            set_limit(libc::RLIMIT_AS, bytes, bytes)?;
        }
        if let Some(processes) = self.processes {
            set_limit(libc::RLIMIT_NPROC, processes, processes)?;
        }
        Ok(())
    }

    /// A failure here fails the spawn; the process never runs unconfined.
    fn unshare(&self) -> io::Result<()> {
        if unsafe { libc::unshare(self.namespaces) } != 0 {
            return Err(io::Error::last_os_error());
        }
        write_proc(c"/proc/self/setgroups", b"deny")?;
        write_proc(c"/proc/self/uid_map", &self.uid_map)?;
        write_proc(c"/proc/self/gid_map", &self.gid_map)?;
        Ok(())
    }
}

/// Maps one id into the namespace: itself, or [`OVERFLOW_ID`] for root.
fn id_map(outside: u32) -> Vec<u8> {
    let inside = if outside == 0 { OVERFLOW_ID } else { outside };
    format!("{inside} {outside} 1\n").into_bytes()
}

fn set_limit(resource: Resource, soft: u64, hard: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn write_proc(path: &CStr, data: &[u8]) -> io::Result<()> {
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let written = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
    let result = if written < 0 || written as usize != data.len() {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    };
    unsafe { libc::close(fd) };
    result
}
