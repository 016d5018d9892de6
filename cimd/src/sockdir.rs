//! Provisioning of the rendezvous socket directory for non-root mode.
//!
//! The directory holds at most the socket of the running instance: every
//! entry left behind by a previous run is removed before a fresh name is
//! generated, so a stale socket can never be reused.

use crate::{config::ServiceAccount, error::Error};
use arrayvec::ArrayString;
use cimd_log::{info, warn};
use nix::unistd::chown;
use rand::{distributions::Alphanumeric, rngs::StdRng, Rng, SeedableRng};
use std::{
    fs::{self, DirBuilder, Permissions},
    os::unix::fs::{DirBuilderExt, PermissionsExt},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

/// Prefix of the rendezvous socket name.
pub const SOCKET_PREFIX: &str = "cimd_";

/// Length of the random part of the socket name.
pub const NAME_LENGTH: usize = 8;

/// Directory mode, restricted to the owner.
const DIRECTORY_MODE: u32 = 0o700;

static DRAWS: AtomicU64 = AtomicU64::new(0);

/// Generate a random socket name suffix from `[A-Za-z0-9]`.
///
/// The name only has to be unique, not unguessable: the generator is
/// seeded from the wall clock and a per-process draw counter.
pub fn random_name() -> ArrayString<NAME_LENGTH> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|time| time.as_nanos() as u64)
        .unwrap_or_default();
    let draw = DRAWS.fetch_add(1, Ordering::Relaxed);
    let mut rng = StdRng::seed_from_u64(nanos ^ draw.rotate_left(32));

    let mut name = ArrayString::new();
    for _ in 0..NAME_LENGTH {
        name.push(char::from(rng.sample(Alphanumeric)));
    }
    name
}

/// Prepare `dir` and return a fresh rendezvous socket path inside it.
///
/// The directory is created with mode `0700` if it is missing and
/// restricted to `0700` if it exists.  When `owner` is set, the
/// directory is handed over to the service account that the engine runs
/// as.  Stale entries are only removed once the directory is restricted.
pub fn provision(dir: &Path, owner: Option<&ServiceAccount>) -> Result<PathBuf, Error> {
    let create_error = |err| Error::DirectoryCreate(dir.to_path_buf(), err);

    DirBuilder::new()
        .recursive(true)
        .mode(DIRECTORY_MODE)
        .create(dir)
        .map_err(create_error)?;
    fs::set_permissions(dir, Permissions::from_mode(DIRECTORY_MODE)).map_err(create_error)?;

    if let Some(owner) = owner {
        chown(dir, Some(owner.uid), Some(owner.gid))
            .map_err(|err| Error::OwnershipChange(dir.to_path_buf(), err))?;
    }

    for entry in fs::read_dir(dir).map_err(create_error)?.flatten() {
        let path = entry.path();
        info!("Removing {}...", path.display());
        if let Err(err) = fs::remove_file(&path) {
            warn!("failed to remove {}: {}", path.display(), err);
        }
    }

    Ok(dir.join(format!("{}{}", SOCKET_PREFIX, random_name())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{getgid, getuid, Uid, User};
    use std::os::unix::{fs::MetadataExt, net::UnixListener};

    #[test]
    fn test_random_name() {
        let a = random_name();
        let b = random_name();
        assert_eq!(a.len(), NAME_LENGTH);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_provision_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("etc/sockets");

        let path = provision(&dir, None).unwrap();
        assert_eq!(path.parent(), Some(dir.as_path()));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(SOCKET_PREFIX));
        assert_eq!(name.len(), SOCKET_PREFIX.len() + NAME_LENGTH);

        let mode = fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, DIRECTORY_MODE);
    }

    #[test]
    fn test_provision_removes_stale_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("sockets");
        fs::create_dir(&dir).unwrap();
        fs::set_permissions(&dir, Permissions::from_mode(0o777)).unwrap();
        fs::write(dir.join("cimd_stale001"), b"").unwrap();
        let _stale = UnixListener::bind(dir.join("cimd_stale002")).unwrap();

        let path = provision(&dir, None).unwrap();
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        let _listener = UnixListener::bind(&path).unwrap();
        let entries = fs::read_dir(&dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect::<Vec<_>>();
        assert_eq!(entries, vec![path]);

        let mode = fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, DIRECTORY_MODE);
    }

    #[test]
    fn test_provision_owner() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("sockets");
        let owner = ServiceAccount {
            name: User::from_uid(getuid())
                .ok()
                .flatten()
                .map(|user| user.name)
                .unwrap_or_default(),
            uid: getuid(),
            gid: getgid(),
        };

        provision(&dir, Some(&owner)).unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn test_provision_restricts_before_emptying() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("sockets");
        fs::create_dir(&dir).unwrap();
        fs::set_permissions(&dir, Permissions::from_mode(0o777)).unwrap();
        fs::write(dir.join("cimd_stale001"), b"").unwrap();

        let uid = Uid::from_raw(getuid().as_raw() + 1);
        let owner = ServiceAccount {
            name: "other".into(),
            uid,
            gid: getgid(),
        };

        match provision(&dir, Some(&owner)) {
            // Root may hand the directory over: it is restricted and empty.
            Ok(_) => {
                let metadata = fs::metadata(&dir).unwrap();
                assert_eq!(metadata.uid(), uid.as_raw());
                assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
            }
            // Otherwise nothing is removed from a directory we could not
            // hand over, but it is no longer open to others.
            Err(Error::OwnershipChange(path, _)) => {
                assert_eq!(path, dir);
                assert!(dir.join("cimd_stale001").exists());
            }
            result => panic!("unexpected result: {:?}", result),
        }

        let mode = fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, DIRECTORY_MODE);
    }
}
